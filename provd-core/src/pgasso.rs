//! Automatic plugin association.
//!
//! Each loaded plugin may expose an associator returning a support score
//! for a device info object. The pipeline picks the best-scoring plugin
//! above a threshold; ties are broken by a conflict solver.

use crate::device::DeviceInfo;

/// Confidence a plugin has that it should handle a given device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceSupport {
    /// The device is known to not be supported.
    None,
    /// It is expected the device won't be supported.
    Improbable,
    /// Not enough information is available to take a decision, or the
    /// plugin is not interested in supporting the device.
    Unknown,
    /// It is expected the device will be supported, but either some
    /// information is missing or no test has been done.
    Probable,
    /// The device is supported, but in an incomplete way.
    Incomplete,
    /// The device is completely supported, possibly in a closely similar
    /// version rather than the targeted one.
    Complete,
    /// The device is exactly what the plugin is targeting.
    Exact,
}

impl DeviceSupport {
    /// Numeric score on the documented 0..=600 scale.
    pub fn score(&self) -> u16 {
        match self {
            DeviceSupport::None => 0,
            DeviceSupport::Improbable => 100,
            DeviceSupport::Unknown => 200,
            DeviceSupport::Probable => 300,
            DeviceSupport::Incomplete => 400,
            DeviceSupport::Complete => 500,
            DeviceSupport::Exact => 600,
        }
    }
}

/// Associate a support score to a device info object.
pub trait PluginAssociator: Send + Sync {
    fn associate(&self, dev_info: &DeviceInfo) -> DeviceSupport;
}

/// Associator skeleton resolving vendor/model/version first.
///
/// Returns `Unknown` when no vendor is available, otherwise delegates to
/// the vendor-aware scoring function.
pub struct BasePgAssociator<F>
where
    F: Fn(&str, Option<&str>, Option<&str>) -> DeviceSupport + Send + Sync,
{
    do_associate: F,
}

impl<F> BasePgAssociator<F>
where
    F: Fn(&str, Option<&str>, Option<&str>) -> DeviceSupport + Send + Sync,
{
    pub fn new(do_associate: F) -> Self {
        Self { do_associate }
    }
}

impl<F> PluginAssociator for BasePgAssociator<F>
where
    F: Fn(&str, Option<&str>, Option<&str>) -> DeviceSupport + Send + Sync,
{
    fn associate(&self, dev_info: &DeviceInfo) -> DeviceSupport {
        let Some(vendor) = dev_info.vendor.as_deref() else {
            return DeviceSupport::Unknown;
        };
        (self.do_associate)(vendor, dev_info.model.as_deref(), dev_info.version.as_deref())
    }
}

/// Break ties between equally-scored plugins.
pub trait ConflictSolver: Send + Sync {
    /// Return a plugin id or `None` when unable to solve the conflict.
    /// Callers only invoke this with at least two candidates.
    fn solve(&self, pg_ids: &[String]) -> Option<String>;
}

/// Default solver: the last plugin id in alphabetical order wins, which
/// favours the most recent vendor plugin naming scheme.
pub struct ReverseAlphabeticConflictSolver;

impl ConflictSolver for ReverseAlphabeticConflictSolver {
    fn solve(&self, pg_ids: &[String]) -> Option<String> {
        pg_ids.iter().max().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_support_ordering() {
        assert!(DeviceSupport::None < DeviceSupport::Improbable);
        assert!(DeviceSupport::Probable < DeviceSupport::Incomplete);
        assert!(DeviceSupport::Complete < DeviceSupport::Exact);
        assert_eq!(DeviceSupport::Probable.score(), 300);
        assert_eq!(DeviceSupport::Exact.score(), 600);
    }

    #[test]
    fn test_base_associator_without_vendor() {
        let associator = BasePgAssociator::new(|_, _, _| DeviceSupport::Exact);
        assert_eq!(
            associator.associate(&DeviceInfo::default()),
            DeviceSupport::Unknown
        );
    }

    #[test]
    fn test_base_associator_with_vendor() {
        let associator = BasePgAssociator::new(|vendor, model, _| {
            if vendor == "Acme" && model == Some("X1") {
                DeviceSupport::Exact
            } else {
                DeviceSupport::None
            }
        });
        let dev_info = DeviceInfo {
            vendor: Some("Acme".to_string()),
            model: Some("X1".to_string()),
            ..Default::default()
        };
        assert_eq!(associator.associate(&dev_info), DeviceSupport::Exact);
    }

    #[test]
    fn test_reverse_alphabetic_solver() {
        let solver = ReverseAlphabeticConflictSolver;
        let ids = vec!["acme-a".to_string(), "acme-b".to_string()];
        assert_eq!(solver.solve(&ids), Some("acme-b".to_string()));
    }
}
