//! Architectural Enforcement
//!
//! Source scanning helpers shared by the integration tests in `tests/`.
//! The tests enforce rules on production code:
//! - No blocking I/O or sleeping inside async functions
//! - No `unwrap()`/`expect()` outside test modules
//!
//! Production code ends at the first `#[cfg(test)]` line of a file.

use std::fs;
use std::path::{Path, PathBuf};

/// Workspace root, two levels above this package
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// All `.rs` files below `dir` (relative to the workspace root), sorted
pub fn source_files(dir: &str) -> Vec<PathBuf> {
    let root = workspace_root().join(dir);
    if !root.exists() {
        return Vec::new();
    }

    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// Lines of a file up to its test module, with comments stripped
pub fn production_lines(path: &Path) -> Vec<String> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };

    content
        .lines()
        .take_while(|line| !line.trim_start().starts_with("#[cfg(test)]"))
        .map(|line| line.split("//").next().unwrap_or(line).to_string())
        .collect()
}

fn declares_fn(line: &str) -> bool {
    let line = line.trim();
    line.starts_with("fn ") || line.contains(" fn ")
}

/// Whether the function enclosing `idx` is an `async fn`
pub fn is_in_async_function(lines: &[String], idx: usize) -> bool {
    for line in lines[..=idx].iter().rev() {
        if declares_fn(line) {
            return line.contains("async fn ");
        }

        let trimmed = line.trim();
        if trimmed.starts_with("mod ") || (trimmed.starts_with("impl") && trimmed.contains('{')) {
            return false;
        }
    }
    false
}

/// A rule violation at `path:line`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File the violation was found in
    pub path: PathBuf,
    /// One-based line number
    pub line: usize,
    /// What was found
    pub reason: &'static str,
    /// The offending source text
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} - {}: {}",
            self.path.display(),
            self.line,
            self.reason,
            self.text.trim()
        )
    }
}

/// Apply `check` to every production line of every file below `dirs`
pub fn scan<F>(dirs: &[&str], mut check: F) -> Vec<Violation>
where
    F: FnMut(&[String], usize) -> Option<&'static str>,
{
    let mut violations = Vec::new();
    for dir in dirs {
        for path in source_files(dir) {
            let lines = production_lines(&path);
            for idx in 0..lines.len() {
                if let Some(reason) = check(&lines, idx) {
                    violations.push(Violation {
                        path: path.clone(),
                        line: idx + 1,
                        reason,
                        text: lines[idx].clone(),
                    });
                }
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(src: &[&str]) -> Vec<String> {
        src.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_async_function_detection() {
        let code = lines(&[
            "pub async fn open(&self) {",
            "    let data = std::fs::read(\"x\");",
            "}",
            "fn load() {",
            "    let data = std::fs::read(\"x\");",
            "}",
        ]);

        assert!(is_in_async_function(&code, 1));
        assert!(!is_in_async_function(&code, 4));
    }

    #[test]
    fn test_impl_boundary_stops_search() {
        let code = lines(&["async fn a() {}", "impl Foo {", "    const X: u8 = 1;"]);
        assert!(!is_in_async_function(&code, 2));
    }

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let dir = std::env::temp_dir().join(format!("enforcement-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let file = dir.join("sample.rs");
        fs::write(
            &file,
            "fn a() {} // note\n#[cfg(test)]\nmod tests { fn b() { x.unwrap(); } }\n",
        )
        .unwrap();

        assert_eq!(production_lines(&file), vec!["fn a() {} ".to_string()]);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_workspace_contains_core() {
        assert!(!source_files("streamline/core/src").is_empty());
    }
}
