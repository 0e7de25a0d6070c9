mod support;

use nexus_protocol::Identifier;
use support::{client::Client, daemon::Proc};

#[test]
fn connect_handshake_issues_a_token() {
    let proc = Proc::spawn().expect("spawning daemon");
    let client = Client::connect(&proc.bind_addr, Identifier::new("cc.example", "app"), "0.1.0", None)
        .expect("handshake should succeed");
    assert!(!client.token.is_empty());
}

#[test]
fn reconnecting_with_the_same_token_preserves_identity() {
    let proc = Proc::spawn().expect("spawning daemon");

    let app = Identifier::new("cc.example", "app");
    let first = Client::connect(&proc.bind_addr, app.clone(), "0.1.0", None).expect("first connect");

    let second = Client::connect(&proc.bind_addr, app, "0.1.0", Some(first.token.clone()))
        .expect("reconnect with known token");
    assert_eq!(first.token, second.token);
}

#[test]
fn unknown_token_mints_a_fresh_one_instead_of_failing() {
    let proc = Proc::spawn().expect("spawning daemon");
    let app = Identifier::new("cc.example", "app");
    let client = Client::connect(&proc.bind_addr, app, "0.1.0", Some("not-a-real-token".to_string()))
        .expect("bogus token should not fail the handshake");
    assert_ne!(client.token, "not-a-real-token");
}
