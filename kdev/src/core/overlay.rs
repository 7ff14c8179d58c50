//! Kernel configuration overlays applied on top of `defconfig`.

use serde::{Deserialize, Serialize};

/// Value of a single overlay entry.
///
/// In `kdev.toml` the variant is selected by `kind`:
///
/// ```toml
/// [[kernel.overlays]]
/// key = "CONFIG_FRAME_WARN"
/// kind = "number"
/// value = 2048
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OverlayValue {
    Enable,
    Disable,
    Module,
    #[serde(rename = "string")]
    Str { value: String },
    #[serde(rename = "number")]
    Num { value: i64 },
}

/// One `key = value` entry applied with `scripts/config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KconfigOverlay {
    pub key: String,
    #[serde(flatten)]
    pub value: OverlayValue,
}

impl KconfigOverlay {
    pub fn new(key: &str, value: OverlayValue) -> Self {
        Self {
            key: key.to_string(),
            value,
        }
    }

    /// Arguments for `scripts/config --file <path>` that apply this entry.
    pub fn script_args(&self) -> Vec<String> {
        let key = self.key.clone();
        match &self.value {
            OverlayValue::Enable => vec!["--enable".to_string(), key],
            OverlayValue::Disable => vec!["--disable".to_string(), key],
            OverlayValue::Module => vec!["--module".to_string(), key],
            OverlayValue::Str { value } => vec!["--set-str".to_string(), key, value.clone()],
            OverlayValue::Num { value } => vec!["--set-val".to_string(), key, value.to_string()],
        }
    }
}

/// Debug-friendly overlay set used when `kdev.toml` declares none.
pub fn default_overlays() -> Vec<KconfigOverlay> {
    use OverlayValue::{Disable, Enable, Module, Num};

    let entries = [
        // keep the optimizer from folding away what a debugger needs
        ("CONFIG_CC_OPTIMIZE_FOR_PERFORMANCE", Disable),
        ("CONFIG_CC_OPTIMIZE_FOR_SIZE", Disable),
        ("CONFIG_OPTIMIZE_INLINING", Disable),
        ("CONFIG_FUNCTION_TRACER", Disable),
        ("CONFIG_X86_GENERICARCH", Disable),
        // initramfs
        ("CONFIG_BLK_DEV_INITRD", Enable),
        ("CONFIG_DEVTMPFS", Enable),
        ("CONFIG_DEVTMPFS_MOUNT", Enable),
        ("CONFIG_BLK_DEV_RAM", Module),
        ("CONFIG_BLK_DEV_RAM_COUNT", Num { value: 16 }),
        ("CONFIG_BLK_DEV_RAM_SIZE", Num { value: 65536 }),
        // debug info
        ("CONFIG_DEBUG_INFO", Enable),
        ("CONFIG_AS_HAS_NON_CONST_LEB128", Enable),
        ("CONFIG_DEBUG_INFO_NONE", Disable),
        ("CONFIG_DEBUG_INFO_DWARF_TOOLCHAIN_DEFAULT", Disable),
        ("CONFIG_DEBUG_INFO_DWARF4", Disable),
        ("CONFIG_DEBUG_INFO_DWARF5", Enable),
        ("CONFIG_RANDOMIZE_BASE", Disable),
        ("CONFIG_DEBUG_INFO_REDUCED", Disable),
        ("CONFIG_DEBUG_INFO_COMPRESSED_NONE", Enable),
        ("CONFIG_DEBUG_INFO_COMPRESSED_ZLIB", Enable),
        ("CONFIG_DEBUG_INFO_COMPRESSED_ZSTD", Disable),
        ("CONFIG_DEBUG_INFO_SPLIT", Disable),
        ("CONFIG_GDB_SCRIPTS", Enable),
        ("CONFIG_FRAME_WARN", Num { value: 2048 }),
        ("CONFIG_STRIP_ASM_SYMS", Disable),
        ("CONFIG_READABLE_ASM", Disable),
        ("CONFIG_HEADERS_INSTALL", Disable),
        ("CONFIG_DEBUG_SECTION_MISMATCH", Disable),
        ("CONFIG_SECTION_MISMATCH_WARN_ONLY", Enable),
        ("CONFIG_DEBUG_FORCE_WEAK_PER_CPU", Disable),
    ];
    entries
        .into_iter()
        .map(|(key, value)| KconfigOverlay::new(key, value))
        .collect()
}

/// Overlays appended when Rust-for-Linux support is requested.
pub fn rust_overlays() -> Vec<KconfigOverlay> {
    use OverlayValue::{Disable, Enable, Module};

    let entries = [
        ("CONFIG_RUST", Enable),
        ("CONFIG_RUST_DEBUG_ASSERTIONS", Enable),
        ("CONFIG_RUST_OVERFLOW_CHECKS", Enable),
        ("CONFIG_RUST_BUILD_ASSERT_ALLOW", Enable),
        ("CONFIG_SAMPLES", Enable),
        ("CONFIG_SAMPLES_RUST", Enable),
        ("CONFIG_RUST_FW_LOADER_ABSTRACTIONS", Enable),
        ("CONFIG_BLK_DEV_RUST_NULL", Module),
        ("CONFIG_RUST_PHYLIB_ABSTRACTIONS", Enable),
        ("CONFIG_AMCC_QT2025_PHY", Enable),
        // CONFIG_SAMPLES pulls in the C samples too; keep only the Rust ones
        ("CONFIG_SAMPLE_AUXDISPLAY", Disable),
        ("CONFIG_SAMPLE_TRACE_EVENTS", Disable),
        ("CONFIG_SAMPLE_TRACE_CUSTOM_EVENTS", Disable),
        ("CONFIG_SAMPLE_TRACE_PRINTK", Disable),
        ("CONFIG_SAMPLE_TRACE_ARRAY", Disable),
        ("CONFIG_SAMPLE_KOBJECT", Disable),
        ("CONFIG_SAMPLE_KPROBES", Disable),
        ("CONFIG_SAMPLE_HW_BREAKPOINT", Disable),
        ("CONFIG_SAMPLE_KFIFO", Disable),
        ("CONFIG_SAMPLE_WATCHDOG", Disable),
        ("CONFIG_SAMPLE_RUST_MINIMAL", Module),
        ("CONFIG_SAMPLE_RUST_PRINT", Module),
        ("CONFIG_SAMPLE_RUST_HOSTPROGS", Enable),
    ];
    entries
        .into_iter()
        .map(|(key, value)| KconfigOverlay::new(key, value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_args_cover_every_kind() {
        let cases = [
            (OverlayValue::Enable, vec!["--enable", "CONFIG_X"]),
            (OverlayValue::Disable, vec!["--disable", "CONFIG_X"]),
            (OverlayValue::Module, vec!["--module", "CONFIG_X"]),
            (
                OverlayValue::Str {
                    value: "hello".to_string(),
                },
                vec!["--set-str", "CONFIG_X", "hello"],
            ),
            (
                OverlayValue::Num { value: 42 },
                vec!["--set-val", "CONFIG_X", "42"],
            ),
        ];
        for (value, expected) in cases {
            let overlay = KconfigOverlay::new("CONFIG_X", value);
            assert_eq!(overlay.script_args(), expected);
        }
    }

    #[test]
    fn overlays_parse_from_tagged_toml() {
        #[derive(Deserialize)]
        struct Doc {
            overlays: Vec<KconfigOverlay>,
        }

        let doc: Doc = toml::from_str(
            r#"
            [[overlays]]
            key = "CONFIG_DEBUG_INFO"
            kind = "enable"

            [[overlays]]
            key = "CONFIG_LOCALVERSION"
            kind = "string"
            value = "-kdev"

            [[overlays]]
            key = "CONFIG_FRAME_WARN"
            kind = "number"
            value = 2048
            "#,
        )
        .expect("parse");

        assert_eq!(
            doc.overlays,
            vec![
                KconfigOverlay::new("CONFIG_DEBUG_INFO", OverlayValue::Enable),
                KconfigOverlay::new(
                    "CONFIG_LOCALVERSION",
                    OverlayValue::Str {
                        value: "-kdev".to_string()
                    }
                ),
                KconfigOverlay::new("CONFIG_FRAME_WARN", OverlayValue::Num { value: 2048 }),
            ]
        );
    }

    #[test]
    fn default_overlays_keep_declared_order() {
        let overlays = default_overlays();
        assert_eq!(overlays[0].key, "CONFIG_CC_OPTIMIZE_FOR_PERFORMANCE");
        assert_eq!(
            overlays.last().map(|o| o.key.as_str()),
            Some("CONFIG_DEBUG_FORCE_WEAK_PER_CPU")
        );
    }
}
