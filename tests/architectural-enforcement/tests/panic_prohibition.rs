//! Integration Test: Panic Prohibition
//!
//! **Policy**: Production code propagates errors with `?` and typed errors.
//! `unwrap()` and `expect()` are allowed only inside `#[cfg(test)]` modules
//! and integration tests. `unwrap_or`, `unwrap_or_else` and
//! `unwrap_or_default` are fine.

use architectural_enforcement::scan;

#[test]
fn test_no_unwrap_in_production_code() {
    let violations = scan(&["streamline/core/src", "streamline/tap/src"], |lines, idx| {
        let code = &lines[idx];
        if code.contains(".unwrap()") {
            Some("unwrap() in production")
        } else if code.contains(".expect(") {
            Some("expect() in production")
        } else {
            None
        }
    });

    if !violations.is_empty() {
        eprintln!("\n❌ Panicking calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ REQUIRED: return Result and use `?`, or handle the None/Err case");

        panic!("\nFound {} panic violation(s)", violations.len());
    }
}
