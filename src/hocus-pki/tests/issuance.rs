//! Full chain tests: root, leaves, PKCS12 distribution bundle.

use hocus_pki::{client_bundle, create_root, issue, CaConfig, IdentityRole};

fn test_config() -> CaConfig {
    CaConfig {
        key_bits: 2048,
        ..CaConfig::default()
    }
}

#[test]
fn full_chain_for_one_deployment() {
    let config = test_config();
    let ca = create_root(&config).unwrap();

    let server = issue(
        &config,
        IdentityRole::Server,
        "Hocuspocus VPN Server",
        "203.0.113.10",
        &ca,
    )
    .unwrap();
    let iphone = issue(&config, IdentityRole::Client, "iphone", "iphone", &ca).unwrap();
    let macbook = issue(
        &config,
        IdentityRole::Client,
        "macbook-air",
        "macbook-air",
        &ca,
    )
    .unwrap();

    for leaf in [&server, &iphone, &macbook] {
        leaf.verify_issued_by(&ca).unwrap();
        assert_eq!(leaf.issuer, ca.subject);
    }

    // distinct key material per device
    assert_ne!(
        iphone.public_key_der().unwrap(),
        macbook.public_key_der().unwrap()
    );

    let bundle = client_bundle(&iphone, &ca, "opensesame").unwrap();
    assert!(!bundle.is_empty());
}

#[test]
fn two_roots_never_cross_validate() {
    let config = test_config();
    let ca_a = create_root(&config).unwrap();
    let ca_b = create_root(&config).unwrap();

    let leaf_a = issue(&config, IdentityRole::Client, "iphone", "iphone", &ca_a).unwrap();
    assert!(leaf_a.verify_issued_by(&ca_a).is_ok());
    assert!(leaf_a.verify_issued_by(&ca_b).is_err());
}
