use async_trait::async_trait;
use std::io;
use std::path::PathBuf;

use super::MemoryProbe;

/// Free and used memory in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub free: u64,
    pub used: u64,
}

/// Free memory from `/proc/meminfo` (MemAvailable), used memory from the
/// resident set of this process
pub struct ProcMemory {
    meminfo: PathBuf,
    status: PathBuf,
}

impl Default for ProcMemory {
    fn default() -> Self {
        Self {
            meminfo: PathBuf::from("/proc/meminfo"),
            status: PathBuf::from("/proc/self/status"),
        }
    }
}

impl ProcMemory {
    pub fn with_paths(meminfo: impl Into<PathBuf>, status: impl Into<PathBuf>) -> Self {
        Self {
            meminfo: meminfo.into(),
            status: status.into(),
        }
    }
}

#[async_trait]
impl MemoryProbe for ProcMemory {
    async fn usage(&self) -> io::Result<MemoryUsage> {
        let meminfo = tokio::fs::read_to_string(&self.meminfo).await?;
        let status = tokio::fs::read_to_string(&self.status).await?;

        let free = kb_field(&meminfo, "MemAvailable")
            .or_else(|| kb_field(&meminfo, "MemFree"))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no free memory figure"))?;
        let used = kb_field(&status, "VmRSS")
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no VmRSS figure"))?;

        Ok(MemoryUsage {
            free: free * 1024,
            used: used * 1024,
        })
    }
}

/// Value of a `Key:   1234 kB` line, in kB
pub fn kb_field(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let (name, rest) = line.split_once(':')?;
        if name.trim() != key {
            return None;
        }
        rest.split_whitespace().next()?.parse().ok()
    })
}
