//! JIT statistics

use super::codegen::TraceExitStatus;
use super::icache::CacheStats;
use super::trace::TraceError;
use std::collections::BTreeMap;
use std::fmt;

/// Lifetime counters of one engine
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JitStats {
    pub traces_created: u64,
    pub recordings_started: u64,
    pub traces_compiled: u64,
    /// Backend declined or the trace was too short
    pub compile_failures: u64,
    pub aborts: BTreeMap<TraceError, u64>,
    pub trace_invocations: u64,
    pub side_exits: u64,
    pub success_exits: u64,
    pub error_exits: u64,
    pub blacklisted: u64,
    pub instructions_recorded: u64,
    pub ir_removed_by_optimizer: u64,
    pub invalidations: u64,
    pub caches: CacheStats,
}

impl JitStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_abort(&mut self, reason: TraceError) {
        *self.aborts.entry(reason).or_insert(0) += 1;
    }

    pub fn total_aborts(&self) -> u64 {
        self.aborts.values().sum()
    }

    pub fn record_exit(&mut self, status: TraceExitStatus) {
        self.trace_invocations += 1;
        match status {
            TraceExitStatus::Success => self.success_exits += 1,
            TraceExitStatus::SideExit => self.side_exits += 1,
            TraceExitStatus::Error => self.error_exits += 1,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for JitStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "traces created:        {}", self.traces_created)?;
        writeln!(f, "recordings started:    {}", self.recordings_started)?;
        writeln!(f, "traces compiled:       {}", self.traces_compiled)?;
        writeln!(f, "compile failures:      {}", self.compile_failures)?;
        writeln!(f, "blacklisted:           {}", self.blacklisted)?;
        writeln!(f, "aborts:                {}", self.total_aborts())?;
        for (reason, count) in &self.aborts {
            writeln!(f, "  {:<20} {}", format!("{:?}", reason), count)?;
        }
        writeln!(f, "trace invocations:     {}", self.trace_invocations)?;
        writeln!(f, "  success exits:       {}", self.success_exits)?;
        writeln!(f, "  side exits:          {}", self.side_exits)?;
        writeln!(f, "  error exits:         {}", self.error_exits)?;
        writeln!(f, "instructions recorded: {}", self.instructions_recorded)?;
        writeln!(f, "IR removed (DCE):      {}", self.ir_removed_by_optimizer)?;
        writeln!(f, "invalidations:         {}", self.invalidations)?;
        write!(
            f,
            "call caches:           {} cloned, {} frozen, {} cancelled",
            self.caches.cloned, self.caches.frozen, self.caches.cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_counts() {
        let mut stats = JitStats::new();
        stats.record_abort(TraceError::NativeMethod);
        stats.record_abort(TraceError::NativeMethod);
        stats.record_abort(TraceError::BufferFull);
        assert_eq!(stats.total_aborts(), 3);
        assert_eq!(stats.aborts.get(&TraceError::NativeMethod), Some(&2));
    }

    #[test]
    fn test_exit_counts() {
        let mut stats = JitStats::new();
        stats.record_exit(TraceExitStatus::SideExit);
        stats.record_exit(TraceExitStatus::Success);
        stats.record_exit(TraceExitStatus::Success);
        assert_eq!(stats.trace_invocations, 3);
        assert_eq!(stats.success_exits, 2);
        assert_eq!(stats.side_exits, 1);
    }

    #[test]
    fn test_json_uses_reason_names() {
        let mut stats = JitStats::new();
        stats.record_abort(TraceError::UnsupportedOpcode);
        let json = stats.to_json().unwrap();
        assert!(json.contains("\"unsupported_opcode\": 1"));
        assert!(json.contains("\"traces_created\": 0"));
    }
}
