//! Test utilities

use std::sync::OnceLock;

pub fn nchat_binary() -> &'static std::path::PathBuf {
    static BIN: OnceLock<std::path::PathBuf> = OnceLock::new();
    BIN.get_or_init(|| {
        if let Some(bin) = option_env!("CARGO_BIN_EXE_nchat") {
            let path = std::path::PathBuf::from(bin);
            if path.exists() {
                return path;
            }
        }

        // Fallback: workspace `target/debug/nchat` (works when running tests from the repo root).
        let mut fallback = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        fallback.pop(); // nchat
        fallback.pop(); // crates
        fallback.push("target");
        fallback.push("debug");
        fallback.push("nchat");
        #[cfg(windows)]
        fallback.set_extension("exe");

        if !fallback.exists() {
            panic!(
                "nchat binary not found (CARGO_BIN_EXE_nchat missing and fallback path does not exist): {}",
                fallback.display()
            );
        }
        fallback
    })
}
