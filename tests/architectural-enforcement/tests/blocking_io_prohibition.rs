//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async code in the engine MUST NOT block the runtime.
//! **Required**: `tokio::time`, `tokio::net` and async `reqwest`, never their
//! blocking std counterparts inside an `async fn`.
//!
//! Synchronous functions (config loading before streams start) may use
//! `std::fs`.

use architectural_enforcement::{is_in_async_function, scan};

const ENGINE_DIRS: &[&str] = &["streamline/core/src"];
const ALL_DIRS: &[&str] = &["streamline/core/src", "streamline/tap/src"];

#[test]
fn test_no_blocking_io_in_async_code() {
    let violations = scan(ENGINE_DIRS, |lines, idx| {
        let code = &lines[idx];
        if !is_in_async_function(lines, idx) {
            return None;
        }

        if code.contains("std::fs::") {
            Some("Blocking file I/O in async")
        } else if code.contains("std::net::") {
            Some("Blocking network I/O in async")
        } else if code.contains("std::io::stdin()") || code.contains("std::io::stdout()") {
            Some("Blocking stdin/stdout in async")
        } else {
            None
        }
    });

    if !violations.is_empty() {
        eprintln!("\n❌ Blocking I/O found in async engine code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ REQUIRED: tokio::fs, tokio::net, tokio::io");

        panic!("\nFound {} blocking I/O violation(s)", violations.len());
    }
}

#[test]
fn test_no_sleep_or_blocking_http() {
    let violations = scan(ALL_DIRS, |lines, idx| {
        let code = &lines[idx];
        if code.contains("std::thread::sleep") || code.contains("thread::sleep(") {
            Some("Thread sleep")
        } else if code.contains("reqwest::blocking") {
            Some("Blocking HTTP client")
        } else {
            None
        }
    });

    if !violations.is_empty() {
        eprintln!("\n❌ Sleeping or blocking HTTP found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ Wait on I/O: Notify, channels, tokio::time::timeout");

        panic!("\nFound {} violation(s)", violations.len());
    }
}
