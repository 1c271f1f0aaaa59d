//! End-to-end provisioning scenarios over a real application instance.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;

use provd_core::app::ApplicationParams;
use provd_core::config::{selector, Config, ConfigCollection, ROLE_AUTOCREATE};
use provd_core::device::{Added, Device, DeviceCollection};
use provd_core::ident::{RequestInfo, RequestProcessingService};
use provd_core::pgasso::ReverseAlphabeticConflictSolver;
use provd_core::plugin::{PluginManager, StandardPluginDriver};
use provd_core::services::ServiceConfig;
use provd_core::synchronize::testing::{Notify, RecordingSyncService};
use provd_core::{
    DocumentCollection, IdGenerator, ProvisioningApplication, ServiceConfigStore,
};

const TENANT: &str = "tenant1";

struct TestBed {
    app: Arc<ProvisioningApplication>,
    pg_mgr: Arc<PluginManager>,
    sync_service: Arc<RecordingSyncService>,
    dir: TempDir,
}

fn base_raw_config() -> Value {
    json!({
        "ip": "10.0.0.10",
        "http_port": 8667,
        "tftp_port": 69,
        "http_base_url": "http://10.0.0.10:8667",
    })
}

async fn test_bed() -> TestBed {
    let dir = tempfile::tempdir().unwrap();
    let plugins_dir = dir.path().join("plugins");
    let cache_dir = dir.path().join("cache");
    std::fs::create_dir_all(&plugins_dir).unwrap();
    std::fs::create_dir_all(&cache_dir).unwrap();

    let mut pg_mgr = PluginManager::new(&plugins_dir, &cache_dir).unwrap();
    pg_mgr.register_driver(Box::new(StandardPluginDriver));
    let pg_mgr = Arc::new(pg_mgr);
    let sync_service: Arc<RecordingSyncService> = Arc::default();
    let dyn_sync: Arc<dyn provd_core::SynchronizeService> = sync_service.clone();
    pg_mgr.set_sync_service(Some(dyn_sync));

    let app = Arc::new(
        ProvisioningApplication::new(ApplicationParams {
            cfg_collection: ConfigCollection::new(DocumentCollection::new_memory(
                IdGenerator::default(),
            )),
            dev_collection: DeviceCollection::new(DocumentCollection::new_memory(
                IdGenerator::default(),
            )),
            pg_mgr: pg_mgr.clone(),
            service_config: Arc::new(ServiceConfigStore::new_memory(ServiceConfig::default())),
            base_raw_config: base_raw_config(),
            general_config: json!({}),
            plugin_specific_configs: json!({}),
            use_provisioning_key: false,
        })
        .unwrap(),
    );
    app.set_tenant_uuid(Some(TENANT.to_string()));
    app.ensure_indexes().await.unwrap();
    TestBed {
        app,
        pg_mgr,
        sync_service,
        dir,
    }
}

fn pipeline(bed: &TestBed) -> RequestProcessingService {
    RequestProcessingService::standard(
        bed.app.clone(),
        Arc::new(ReverseAlphabeticConflictSolver),
    )
}

fn write_plugin_bundle(plugins_dir: &Path, plugin_id: &str) {
    let plugin_dir = plugins_dir.join(plugin_id);
    std::fs::create_dir_all(&plugin_dir).unwrap();
    std::fs::write(
        plugin_dir.join("plugin-info"),
        serde_json::to_vec(&json!({
            "version": "1.0",
            "description": "Acme Spark phones",
            "capabilities": {"Acme,Spark100,1.0": {}},
        }))
        .unwrap(),
    )
    .unwrap();
}

fn build_plugin_package(dest: &Path, plugin_id: &str) {
    let file = std::fs::File::create(dest).unwrap();
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let info = serde_json::to_vec(&json!({
        "version": "1.0",
        "description": "Acme Spark phones",
        "capabilities": {"Acme,Spark100,1.0": {}},
    }))
    .unwrap();
    let mut header = tar::Header::new_gnu();
    header.set_size(info.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(
            &mut header,
            format!("{plugin_id}/plugin-info"),
            info.as_slice(),
        )
        .unwrap();
    builder.into_inner().unwrap().finish().unwrap();
}

fn full_config(id: &str) -> Config {
    let mut config = Config::new(id);
    config.raw_config = json!({
        "sip_proxy_ip": "10.0.0.1",
        "sip_lines": {
            "1": {
                "username": "alice",
                "password": "secret",
                "display_name": "Alice",
            }
        }
    });
    config
}

#[tokio::test]
async fn test_auto_registration_from_http() {
    let bed = test_bed().await;
    let pipeline = pipeline(&bed);

    let request = RequestInfo::Http {
        ip: "10.0.0.2".to_string(),
        path: "/000011223344.cfg".to_string(),
    };
    let (device, pg_id) = pipeline.process(&request).await;

    // no plugin is installed: the request has nowhere to route
    assert!(pg_id.is_none());
    let device = device.expect("a device must have been auto-created");
    assert_eq!(device.ip.as_deref(), Some("10.0.0.2"));
    assert_eq!(device.added, Some(Added::Auto));
    assert!(!device.configured);
    assert_eq!(device.tenant_uuid, TENANT);

    let stored = bed
        .app
        .dev_find(&selector(json!({"ip": "10.0.0.2"})))
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
}

#[tokio::test]
async fn test_config_inheritance() {
    let bed = test_bed().await;
    let mut base = Config::new("base");
    base.raw_config = json!({
        "ntp_ip": "10.0.0.1",
        "sip_lines": {"1": {"proxy_ip": "10.0.0.1"}},
    });
    bed.app.cfg_insert(&mut base).await.unwrap();

    let mut child = Config::new("child");
    child.parent_ids = vec!["base".to_string()];
    child.raw_config = json!({
        "sip_lines": {"1": {"username": "alice", "password": "p", "display_name": "Alice"}},
    });
    bed.app.cfg_insert(&mut child).await.unwrap();

    let raw = bed
        .app
        .cfg_retrieve_raw_config("child")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(raw["ntp_ip"], "10.0.0.1");
    assert_eq!(
        raw["sip_lines"]["1"],
        json!({
            "proxy_ip": "10.0.0.1",
            "registrar_ip": "10.0.0.1",
            "username": "alice",
            "auth_username": "alice",
            "password": "p",
            "display_name": "Alice",
        })
    );
    assert_eq!(raw["sip_srtp_mode"], "disabled");
    assert_eq!(raw["sip_transport"], "udp");
    assert_eq!(raw["sccp_call_managers"], json!({}));
    assert_eq!(raw["funckeys"], json!({}));
    // base raw-config defaults are part of the materialization
    assert_eq!(raw["ip"], "10.0.0.10");
    assert_eq!(raw["http_port"], 8667);
    assert_eq!(raw["tftp_port"], 69);
}

#[tokio::test]
async fn test_config_delete_splices_chain() {
    let bed = test_bed().await;
    let mut base = Config::new("base");
    base.raw_config = json!({"a": 1});
    bed.app.cfg_insert(&mut base).await.unwrap();
    let mut mid = Config::new("mid");
    mid.parent_ids = vec!["base".to_string()];
    mid.raw_config = json!({"b": 2});
    bed.app.cfg_insert(&mut mid).await.unwrap();
    let mut leaf = Config::new("leaf");
    leaf.parent_ids = vec!["mid".to_string()];
    leaf.raw_config = json!({"c": 3});
    bed.app.cfg_insert(&mut leaf).await.unwrap();

    bed.app.cfg_delete("mid").await.unwrap();

    let leaf = bed.app.cfg_retrieve("leaf").await.unwrap().unwrap();
    assert_eq!(leaf.parent_ids, vec!["base".to_string()]);
    let raw = bed
        .app
        .cfg_retrieve_raw_config("leaf")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(raw["a"], 1);
    assert_eq!(raw["c"], 3);
    assert!(raw.get("b").is_none());
}

#[tokio::test]
async fn test_transient_config_cleanup() {
    let bed = test_bed().await;
    let mut template = Config::new("ap");
    template.role = Some(ROLE_AUTOCREATE.to_string());
    template.raw_config = json!({"sip_lines": {"1": {"username": "anonymous"}}});
    bed.app.cfg_insert(&mut template).await.unwrap();

    let new_config_id = bed.app.cfg_create_new().await.unwrap().unwrap();
    assert!(new_config_id.starts_with("ap"));

    let mut device = Device::new(TENANT);
    device.config = Some(new_config_id.clone());
    let device_id = bed.app.dev_insert(&mut device).await.unwrap();

    assert!(bed
        .app
        .cfg_retrieve(&new_config_id)
        .await
        .unwrap()
        .is_some());
    bed.app.dev_delete(&device_id).await.unwrap();
    // the transient config died with its last referrer
    assert!(bed
        .app
        .cfg_retrieve(&new_config_id)
        .await
        .unwrap()
        .is_none());
    // the template itself is untouched
    assert!(bed.app.cfg_retrieve("ap").await.unwrap().is_some());
}

#[tokio::test]
async fn test_tenant_deleted_event() {
    let bed = test_bed().await;
    let mut d1 = Device::new(TENANT);
    d1.mac = Some("00:11:22:33:44:55".to_string());
    bed.app.dev_insert(&mut d1).await.unwrap();
    let mut d2 = Device::new("tenant2");
    d2.mac = Some("00:11:22:33:44:66".to_string());
    bed.app.dev_insert(&mut d2).await.unwrap();
    bed.app
        .service_config()
        .set_provisioning_key(TENANT, Some("abcdefgh".to_string()))
        .await
        .unwrap();

    bed.app.handle_tenant_deleted(TENANT).await.unwrap();

    let remaining = bed.app.dev_find(&selector(json!({}))).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].tenant_uuid, "tenant2");
    assert!(bed.app.service_config().provisioning_key(TENANT).is_none());
}

#[tokio::test]
async fn test_plugin_install_reconfigures_existing_devices() {
    let bed = test_bed().await;

    // a device already referencing the not-yet-installed plugin
    bed.app.cfg_insert(&mut full_config("c1")).await.unwrap();
    let mut device = Device::new(TENANT);
    device.mac = Some("00:11:22:33:44:aa".to_string());
    device.plugin = Some("acme-spark".to_string());
    device.config = Some("c1".to_string());
    let device_id = bed.app.dev_insert(&mut device).await.unwrap();
    assert!(!device.configured);

    // seed the repository index and the package cache
    let plugins_dir = bed.dir.path().join("plugins");
    let cache_dir = bed.dir.path().join("cache");
    std::fs::write(
        plugins_dir.join("plugins.db"),
        serde_json::to_vec(&json!({
            "acme-spark": {
                "filename": "acme-spark-1.0.tar.gz",
                "version": "1.0",
                "description": "Acme Spark phones",
            }
        }))
        .unwrap(),
    )
    .unwrap();
    build_plugin_package(&cache_dir.join("acme-spark-1.0.tar.gz"), "acme-spark");

    let (install, oip) = bed.app.clone().pg_install("acme-spark").unwrap();
    install.await.unwrap();
    assert_eq!(oip.state(), provd_core::OipState::Success);

    assert!(bed.pg_mgr.contains("acme-spark"));
    let device = bed.app.dev_retrieve(&device_id).await.unwrap().unwrap();
    assert!(device.configured);
    // the per-device file appeared under the plugin tree
    let device_file = plugins_dir.join("acme-spark/var/tftpboot/0011223344aa.cfg");
    assert!(device_file.is_file());

    // installing again is refused
    assert!(bed.app.clone().pg_install("acme-spark").is_err());
}

/// Extractor standing in for a vendor bundle's protocol sniffing.
struct VendorExtractor;

#[async_trait::async_trait]
impl provd_core::ident::DeviceInfoExtractor for VendorExtractor {
    async fn extract(&self, _request: &RequestInfo) -> Option<provd_core::DeviceInfo> {
        Some(provd_core::DeviceInfo {
            vendor: Some("Acme".to_string()),
            model: Some("Spark100".to_string()),
            version: Some("1.0".to_string()),
            ..Default::default()
        })
    }
}

#[tokio::test]
async fn test_pipeline_associates_plugin_and_tracks_remote_state() {
    use provd_core::ident::{
        AllPluginsDeviceInfoExtractor, CollaboratingDeviceInfoExtractor, CompositeDeviceUpdater,
        FirstCompositeDeviceRetriever, MergeStrategy, StandardDeviceInfoExtractor,
    };

    let bed = test_bed().await;
    write_plugin_bundle(&bed.dir.path().join("plugins"), "acme-spark");
    bed.app.load_all_plugins().await;
    assert_eq!(bed.pg_mgr.loaded_count(), 1);

    bed.app.cfg_insert(&mut full_config("c1")).await.unwrap();
    let mut device = Device::new(TENANT);
    device.mac = Some("00:11:22:33:44:aa".to_string());
    device.ip = Some("10.0.0.2".to_string());
    device.config = Some("c1".to_string());
    let device_id = bed.app.dev_insert(&mut device).await.unwrap();
    assert!(!device.configured);

    let extractor = Arc::new(CollaboratingDeviceInfoExtractor::new(
        MergeStrategy::LastSeen,
        vec![
            Arc::new(StandardDeviceInfoExtractor),
            Arc::new(AllPluginsDeviceInfoExtractor::new(
                MergeStrategy::Voting,
                bed.pg_mgr.clone(),
            )),
            Arc::new(VendorExtractor),
        ],
    ));
    let pipeline = RequestProcessingService::new(
        bed.app.clone(),
        extractor,
        Arc::new(FirstCompositeDeviceRetriever::standard_chain(
            bed.app.clone(),
        )),
        Arc::new(CompositeDeviceUpdater::standard_chain(
            bed.app.clone(),
            Arc::new(ReverseAlphabeticConflictSolver),
        )),
    );

    // the associator binds the plugin, which reconfigures the device;
    // since the requested file is the remote-state trigger, the SIP
    // username is recorded on the way out
    let request = RequestInfo::Tftp {
        ip: "10.0.0.2".to_string(),
        filename: "0011223344aa.cfg".to_string(),
    };
    let (_, pg_id) = pipeline.process(&request).await;
    assert_eq!(pg_id.as_deref(), Some("acme-spark"));
    let device = bed.app.dev_retrieve(&device_id).await.unwrap().unwrap();
    assert!(device.configured);
    assert_eq!(device.vendor.as_deref(), Some("Acme"));

    // a further request for the trigger file keeps the remote state
    let (_, _) = pipeline.process(&request).await;
    let device = bed.app.dev_retrieve(&device_id).await.unwrap().unwrap();
    assert_eq!(device.remote_state_sip_username.as_deref(), Some("alice"));
}

#[tokio::test]
async fn test_dhcp_info_creates_and_refreshes_device() {
    use provd_core::dhcp::{DhcpInfo, DhcpRequestProcessingService};
    use std::collections::HashMap;

    let bed = test_bed().await;
    let service = DhcpRequestProcessingService::new(Arc::new(pipeline(&bed)));

    service
        .handle_dhcp_info(DhcpInfo {
            op: "commit".to_string(),
            ip: "10.0.0.3".to_string(),
            mac: "00-11-22-33-44-BB".to_string(),
            options: HashMap::new(),
        })
        .await
        .unwrap();

    let device = bed
        .app
        .dev_find_one(&selector(json!({"mac": "00:11:22:33:44:bb"})))
        .await
        .unwrap()
        .expect("device auto-created from DHCP info");
    assert_eq!(device.ip.as_deref(), Some("10.0.0.3"));
    assert_eq!(device.added, Some(Added::Auto));

    // the device moved: the same MAC reports a new address
    service
        .handle_dhcp_info(DhcpInfo {
            op: "commit".to_string(),
            ip: "10.0.0.4".to_string(),
            mac: "0011223344bb".to_string(),
            options: HashMap::new(),
        })
        .await
        .unwrap();
    let devices = bed.app.dev_find(&selector(json!({}))).await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].ip.as_deref(), Some("10.0.0.4"));

    // non-commit operations are ignored
    service
        .handle_dhcp_info(DhcpInfo {
            op: "expiry".to_string(),
            ip: "10.0.0.9".to_string(),
            mac: "00:11:22:33:44:cc".to_string(),
            options: HashMap::new(),
        })
        .await
        .unwrap();
    let devices = bed.app.dev_find(&selector(json!({}))).await.unwrap();
    assert_eq!(devices.len(), 1);
}

#[tokio::test]
async fn test_synchronize_requires_configured_device() {
    let bed = test_bed().await;
    write_plugin_bundle(&bed.dir.path().join("plugins"), "acme-spark");
    bed.app.load_all_plugins().await;

    bed.app.cfg_insert(&mut full_config("c1")).await.unwrap();
    let mut device = Device::new(TENANT);
    device.mac = Some("00:11:22:33:44:aa".to_string());
    device.ip = Some("10.0.0.2".to_string());
    let device_id = bed.app.dev_insert(&mut device).await.unwrap();

    // not configured yet
    assert!(bed.app.dev_synchronize(&device_id).await.is_err());

    device.plugin = Some("acme-spark".to_string());
    device.config = Some("c1".to_string());
    bed.app.dev_update(&mut device).await.unwrap();
    assert!(device.configured);

    bed.app.dev_synchronize(&device_id).await.unwrap();
    let notifications = bed.sync_service.notifications.lock().unwrap();
    assert_eq!(
        notifications.as_slice(),
        &[Notify::ByIp {
            ip: "10.0.0.2".to_string(),
            event: "check-sync".to_string()
        }]
    );
}

#[tokio::test]
async fn test_config_update_flips_configured_flag() {
    let bed = test_bed().await;
    write_plugin_bundle(&bed.dir.path().join("plugins"), "acme-spark");
    bed.app.load_all_plugins().await;

    bed.app.cfg_insert(&mut full_config("c1")).await.unwrap();
    let mut device = Device::new(TENANT);
    device.mac = Some("00:11:22:33:44:aa".to_string());
    device.plugin = Some("acme-spark".to_string());
    device.config = Some("c1".to_string());
    let device_id = bed.app.dev_insert(&mut device).await.unwrap();
    assert!(device.configured);

    // break the config: a SIP line without credentials no longer
    // validates, so dependent devices fall out of the configured state
    let mut broken = bed.app.cfg_retrieve("c1").await.unwrap().unwrap();
    broken.raw_config = json!({"protocol": "SIP", "sip_lines": {"1": {"proxy_ip": "10.0.0.1"}}});
    bed.app.cfg_update(&broken).await.unwrap();

    let device = bed.app.dev_retrieve(&device_id).await.unwrap().unwrap();
    assert!(!device.configured);

    // deleting the config keeps the device unconfigured
    bed.app.cfg_delete("c1").await.unwrap();
    let device = bed.app.dev_retrieve(&device_id).await.unwrap().unwrap();
    assert!(!device.configured);
}

async fn configured_device(bed: &TestBed) -> Device {
    write_plugin_bundle(&bed.dir.path().join("plugins"), "acme-spark");
    bed.app.load_all_plugins().await;
    bed.app.cfg_insert(&mut full_config("c1")).await.unwrap();
    let mut device = Device::new(TENANT);
    device.mac = Some("00:11:22:33:44:aa".to_string());
    device.ip = Some("127.0.0.1".to_string());
    device.plugin = Some("acme-spark".to_string());
    device.config = Some("c1".to_string());
    bed.app.dev_insert(&mut device).await.unwrap();
    assert!(device.configured);
    device
}

#[tokio::test]
async fn test_http_surface_serves_device_files() {
    use provd_core::http::{self, HttpServerState};

    let bed = test_bed().await;
    configured_device(&bed).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(HttpServerState {
        app: bed.app.clone(),
        process_service: Arc::new(pipeline(&bed)),
        trusted_proxies: 0,
    });
    let server = tokio::spawn(http::serve_listener(listener, state));

    let body = reqwest::get(format!("http://{addr}/0011223344aa.cfg"))
        .await
        .unwrap();
    assert!(body.status().is_success());
    let content = body.text().await.unwrap();
    // the standard driver wrote the materialized raw config as JSON
    let raw: Value = serde_json::from_str(&content).unwrap();
    assert_eq!(raw["sip_lines"]["1"]["username"], "alice");

    // an unroutable path falls back to the default not-found resource
    let missing = reqwest::get(format!("http://{addr}/nothing/here"))
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    server.abort();
}

#[tokio::test]
async fn test_tftp_surface_serves_device_files() {
    use provd_core::ident::TftpRequestProcessingService;
    use provd_core::tftp::packet::{build_dgram, parse_dgram, Packet};
    use provd_core::tftp::TftpServer;

    let bed = test_bed().await;
    configured_device(&bed).await;

    let service = Arc::new(TftpRequestProcessingService::new(
        bed.app.clone(),
        Arc::new(pipeline(&bed)),
    ));
    let server = TftpServer::bind("127.0.0.1:0".parse().unwrap(), service)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let _ = server.run().await;
    });

    let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(b"\x00\x010011223344aa.cfg\x00octet\x00", addr)
        .await
        .unwrap();
    let mut content = Vec::new();
    let mut buf = vec![0u8; 65536];
    loop {
        let (len, peer) = client.recv_from(&mut buf).await.unwrap();
        match parse_dgram(&buf[..len]).unwrap() {
            Packet::Data { block_no, data } => {
                let done = data.len() < 512;
                content.extend_from_slice(&data);
                let ack = build_dgram(&Packet::Ack { block_no }).unwrap();
                client.send_to(&ack, peer).await.unwrap();
                if done {
                    break;
                }
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }
    let raw: Value = serde_json::from_slice(&content).unwrap();
    assert_eq!(raw["sip_lines"]["1"]["username"], "alice");

    // a file no plugin serves is rejected
    client
        .send_to(b"\x00\x01unknown.bin\x00octet\x00", addr)
        .await
        .unwrap();
    let (len, _) = client.recv_from(&mut buf).await.unwrap();
    assert!(matches!(
        parse_dgram(&buf[..len]).unwrap(),
        Packet::Error { .. }
    ));
    server.abort();
}

#[tokio::test]
async fn test_uninstall_soft_deconfigures_devices() {
    let bed = test_bed().await;
    write_plugin_bundle(&bed.dir.path().join("plugins"), "acme-spark");
    bed.app.load_all_plugins().await;

    bed.app.cfg_insert(&mut full_config("c1")).await.unwrap();
    let mut device = Device::new(TENANT);
    device.mac = Some("00:11:22:33:44:aa".to_string());
    device.plugin = Some("acme-spark".to_string());
    device.config = Some("c1".to_string());
    let device_id = bed.app.dev_insert(&mut device).await.unwrap();
    assert!(device.configured);

    bed.app.pg_uninstall("acme-spark").await.unwrap();
    assert!(!bed.pg_mgr.contains("acme-spark"));
    assert!(!bed.dir.path().join("plugins/acme-spark").exists());
    let device = bed.app.dev_retrieve(&device_id).await.unwrap().unwrap();
    assert!(!device.configured);
}
