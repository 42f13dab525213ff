//! Unit tests for the `Frame` value type and `Command` mapping.

use stompline::{Command, Frame};

// ============================================================================
// Construction and builders
// ============================================================================

#[test]
fn frame_new_is_empty() {
    let f = Frame::new("SEND");
    assert_eq!(f.command, "SEND");
    assert!(f.headers.is_empty());
    assert!(f.body.is_empty());
}

#[test]
fn headers_keep_insertion_order_and_duplicates() {
    let f = Frame::new("SEND")
        .header("destination", "/queue/a")
        .header("x", "1")
        .headers([("y", "2"), ("x", "3")]);
    let keys: Vec<_> = f.headers.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["destination", "x", "y", "x"]);
    // lookups return the first match
    assert_eq!(f.get_header("x"), Some("1"));
    assert_eq!(f.get_header("X"), None);
}

#[test]
fn set_body_accepts_text_and_bytes() {
    assert_eq!(Frame::new("SEND").set_body("ç").body, vec![0xc3, 0xa7]);
    assert_eq!(
        Frame::new("SEND").set_body(vec![0u8, 1, 2]).body,
        vec![0u8, 1, 2]
    );
    assert_eq!(
        Frame::new("SEND").set_body(String::from("hi")).body,
        b"hi".to_vec()
    );
}

#[test]
fn body_text_replaces_invalid_utf8() {
    let f = Frame::new("MESSAGE").set_body(vec![b'o', b'k', 0xff]);
    assert_eq!(f.body_text(), "ok\u{fffd}");
}

// ============================================================================
// Display
// ============================================================================

#[test]
fn display_lists_command_headers_and_body_size() {
    let f = Frame::new("MESSAGE")
        .header("destination", "/topic/a")
        .set_body("hello");
    let s = f.to_string();
    assert!(s.starts_with("Command: MESSAGE\n"));
    assert!(s.contains("destination: /topic/a\n"));
    assert!(s.contains("Body (5 bytes)"));
}

// ============================================================================
// Equality
// ============================================================================

#[test]
fn equality_covers_every_field() {
    let base = Frame::new("SEND").header("a", "1").set_body("x");
    assert_eq!(base, base.clone());
    assert_ne!(base, Frame::new("ACK").header("a", "1").set_body("x"));
    assert_ne!(base, Frame::new("SEND").header("a", "2").set_body("x"));
    assert_ne!(base, Frame::new("SEND").header("a", "1").set_body("y"));
    assert_ne!(
        base,
        Frame::new("SEND")
            .header("a", "1")
            .header("b", "2")
            .set_body("x")
    );
}

// ============================================================================
// Command
// ============================================================================

#[test]
fn kind_maps_known_commands() {
    assert_eq!(Frame::new("CONNECTED").kind(), Command::Connected);
    assert_eq!(Frame::new("MESSAGE").kind(), Command::Message);
    assert_eq!(Frame::new("ERROR").kind(), Command::Error);
}

#[test]
fn unknown_commands_are_kept_verbatim() {
    let cmd = Frame::new("SOMETHING").kind();
    assert_eq!(cmd, Command::Other("SOMETHING".to_string()));
    assert_eq!(cmd.as_str(), "SOMETHING");
    assert_eq!(cmd.to_string(), "SOMETHING");
}

#[test]
fn commands_are_case_sensitive() {
    assert_eq!(
        Command::parse("message"),
        Command::Other("message".to_string())
    );
}
