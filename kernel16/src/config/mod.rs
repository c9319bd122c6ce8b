use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::Result;

#[derive(Serialize, Deserialize, Clone, Eq, PartialEq, Debug)]
#[serde(default)]
pub struct KernelConfig {
    pub memory: MemoryConfig,
    pub loader: LoaderConfig,
    pub task: TaskConfig,
}

#[derive(Serialize, Deserialize, Clone, Copy, Eq, PartialEq, Debug)]
#[serde(default)]
pub struct MemoryConfig {
    /// Start of the linear range backing the global heap.
    pub linear_base: u32,
    pub linear_size: u32,
    /// Conventional memory pool (below 1MB) used by DOS allocations.
    pub dos_base: u32,
    pub dos_size: u32,
    /// LDT slots below this index are never handed out.
    pub first_selector_index: u16,
}

#[derive(Serialize, Deserialize, Clone, Eq, PartialEq, Debug)]
#[serde(default)]
pub struct LoaderConfig {
    pub search_path: Vec<PathBuf>,
    /// Appended to import names without an extension.
    pub default_extension: String,
    /// Used instead when the importing module predates Windows 3.0.
    pub legacy_extension: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Eq, PartialEq, Debug)]
#[serde(default)]
pub struct TaskConfig {
    pub thread_stack_size: u32,
    pub atom_table_size: u16,
    pub local_handle_delta: u16,
    pub min_thunks: u16,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            memory: MemoryConfig::default(),
            loader: LoaderConfig::default(),
            task: TaskConfig::default(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            linear_base: 0x0100_0000,
            linear_size: 0x0400_0000,
            dos_base: 0x0001_0000,
            dos_size: 0x0009_0000,
            first_selector_index: 17,
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            search_path: vec![PathBuf::from(".")],
            default_extension: ".DLL".to_string(),
            legacy_extension: ".EXE".to_string(),
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            thread_stack_size: 0x10000,
            atom_table_size: 37,
            local_handle_delta: 0x20,
            min_thunks: 32,
        }
    }
}

impl KernelConfig {
    pub fn from_toml(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| anyhow::anyhow!("bad config: {}", e).into())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }
}

#[cfg(test)]
mod test {
    use super::KernelConfig;

    #[test]
    fn test_partial_config() {
        let conf = KernelConfig::from_toml(
            r#"
            [loader]
            search_path = ["/tmp/win16"]

            [task]
            atom_table_size = 101
            "#,
        )
        .unwrap();
        assert_eq!(conf.task.atom_table_size, 101);
        assert_eq!(conf.task.local_handle_delta, 0x20);
        assert_eq!(conf.loader.default_extension, ".DLL");
        assert_eq!(conf.loader.search_path.len(), 1);
        assert_eq!(conf.memory, KernelConfig::default().memory);
    }
}
