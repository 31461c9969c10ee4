#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use hindsight_bundle::{
    detect_cluster_version, detect_service_cidr, load_config_map, load_resources, load_secret, warn_on_errors_file, Bundle, DirBundle,
};

fn write(root: &Path, rel: &str, body: &str) {
    let p = root.join(rel);
    fs::create_dir_all(p.parent().unwrap()).unwrap();
    fs::write(p, body).unwrap();
}

fn fixture() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "cluster-info/cluster_version.json", r#"{"info":{"major":"1","minor":"25+","gitVersion":"v1.25.5"},"string":"v1.25.5"}"#);
    write(
        root,
        "cluster-resources/pods/default.json",
        r#"{"apiVersion":"v1","kind":"PodList","items":[{"metadata":{"name":"web-0","namespace":"default"}}]}"#,
    );
    write(root, "cluster-resources/pods/default-errors.json", r#"["forbidden"]"#);
    write(root, "cluster-resources/nodes.json", r#"[{"metadata":{"name":"node-a"}}]"#);
    write(root, "cluster-resources/deployments/shop.json", r#"{"items":[]}"#);
    write(root, "configmaps/shop/settings.json", r#"{"name":"settings","namespace":"shop","data":{"mode":"fast"}}"#);
    write(root, "secrets/shop/token.json", r#"{"name":"token","namespace":"shop","key":"ignored"}"#);
    dir
}

#[test]
fn walk_is_relative_and_sorted() {
    let dir = fixture();
    let bundle = DirBundle::open(dir.path()).unwrap();
    let files = bundle.walk(Path::new("cluster-resources")).unwrap();
    let expected: Vec<PathBuf> = [
        "cluster-resources/deployments/shop.json",
        "cluster-resources/nodes.json",
        "cluster-resources/pods/default-errors.json",
        "cluster-resources/pods/default.json",
    ]
    .iter()
    .map(PathBuf::from)
    .collect();
    assert_eq!(files, expected);
    assert!(bundle.walk(Path::new("does-not-exist")).unwrap().is_empty());
}

#[test]
fn open_rejects_plain_files() {
    let dir = fixture();
    let err = DirBundle::open(dir.path().join("cluster-resources/nodes.json")).unwrap_err();
    assert!(err.to_string().contains("unknown bundle format"), "err={}", err);
}

#[test]
fn loads_every_resource_shape() {
    let dir = fixture();
    let bundle = DirBundle::open(dir.path()).unwrap();

    let pods = load_resources(&bundle, Path::new("cluster-resources/pods/default.json")).unwrap();
    assert_eq!(pods.len(), 1);
    assert_eq!(pods[0].kind(), "Pod");
    assert_eq!(pods[0].object_key(), "default/web-0");

    let nodes = load_resources(&bundle, Path::new("cluster-resources/nodes.json")).unwrap();
    assert_eq!(nodes[0].name(), "node-a");
    assert!(nodes[0].type_identity().is_empty());

    let deployments = load_resources(&bundle, Path::new("cluster-resources/deployments/shop.json")).unwrap();
    assert!(deployments.is_empty());

    assert!(load_resources(&bundle, Path::new("cluster-resources/missing.json")).is_err());
}

#[test]
fn config_maps_keep_data_and_secrets_drop_it() {
    let dir = fixture();
    let bundle = DirBundle::open(dir.path()).unwrap();

    let cm = load_config_map(&bundle, Path::new("configmaps/shop/settings.json")).unwrap();
    assert_eq!(cm.type_identity().to_string(), "v1/ConfigMap");
    assert_eq!(cm.object_key(), "shop/settings");
    assert_eq!(cm.as_map()["data"]["mode"], "fast");

    let secret = load_secret(&bundle, Path::new("secrets/shop/token.json")).unwrap();
    assert_eq!(secret.type_identity().to_string(), "v1/Secret");
    assert_eq!(secret.object_key(), "shop/token");
    assert!(!secret.as_map().contains_key("data"));
}

#[test]
fn errors_file_is_detected() {
    let dir = fixture();
    let bundle = DirBundle::open(dir.path()).unwrap();
    assert!(warn_on_errors_file(&bundle, Path::new("cluster-resources/pods/default.json")));
    assert!(!warn_on_errors_file(&bundle, Path::new("cluster-resources/nodes.json")));
}

#[test]
fn cluster_version_from_bundle() {
    let dir = fixture();
    let bundle = DirBundle::open(dir.path()).unwrap();
    let v = detect_cluster_version(&bundle).unwrap();
    assert_eq!((v.major, v.minor), (1, 25));
    assert_eq!(v.to_string(), "1.25");
    assert_eq!(v.git_version, "v1.25.5");

    write(dir.path(), "cluster-info/cluster_version.json", r#"{"info":{"major":"1","minor":"27+"}}"#);
    let v = detect_cluster_version(&bundle).unwrap();
    assert_eq!((v.major, v.minor), (1, 27));

    write(dir.path(), "cluster-info/cluster_version.json", r#"{}"#);
    assert!(detect_cluster_version(&bundle).is_err());
}

#[test]
fn service_cidr_from_apiserver_flags() {
    let dir = fixture();
    let bundle = DirBundle::open(dir.path()).unwrap();
    assert!(detect_service_cidr(&bundle).is_err(), "kube-system pods were not recorded");

    write(
        dir.path(),
        "cluster-resources/pods/kube-system.json",
        r#"{"apiVersion":"v1","kind":"PodList","items":[
            {"metadata":{"name":"kube-apiserver-cp-1","namespace":"kube-system"},
             "spec":{"containers":[{"name":"kube-apiserver","command":["kube-apiserver","--secure-port=6443"]}]}},
            {"metadata":{"name":"coredns-abc","namespace":"kube-system"},
             "spec":{"containers":[{"name":"coredns","args":["--service-cluster-ip-range=192.168.0.0/16"]}]}}
        ]}"#,
    );
    assert_eq!(detect_service_cidr(&bundle).unwrap(), None, "apiserver pod lacks the component label");

    write(
        dir.path(),
        "cluster-resources/pods/kube-system.json",
        r#"{"apiVersion":"v1","kind":"PodList","items":[
            {"metadata":{"name":"kube-apiserver-cp-1","namespace":"kube-system","labels":{"component":"kube-apiserver"}},
             "spec":{"containers":[
                {"name":"audit-sidecar","args":["--service-cluster-ip-range=172.16.0.0/12"]},
                {"name":"kube-apiserver","command":["kube-apiserver","--secure-port=6443"],
                 "args":["--service-cluster-ip-range=10.96.0.0/12","--etcd-servers=https://127.0.0.1:2379"]}]}}
        ]}"#,
    );
    assert_eq!(detect_service_cidr(&bundle).unwrap().as_deref(), Some("10.96.0.0/12"));
}

#[cfg(unix)]
#[test]
fn walk_skips_dangling_links() {
    let dir = fixture();
    std::os::unix::fs::symlink(dir.path().join("gone.json"), dir.path().join("cluster-resources/pods/stale.json"))
        .unwrap();
    let bundle = DirBundle::open(dir.path()).unwrap();
    let files = bundle.walk(Path::new("cluster-resources")).unwrap();
    assert_eq!(files.len(), 4, "{:?}", files);
    assert!(files.contains(&PathBuf::from("cluster-resources/pods/default.json")));
    assert!(!files.iter().any(|f| f.ends_with("stale.json")));
}
