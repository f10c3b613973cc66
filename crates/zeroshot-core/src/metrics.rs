//! Process metrics probe.
//!
//! Samples CPU, resident memory, and network byte counters for a child
//! PID over a short window by reading `/proc`. Non-Linux platforms report
//! no data; the status observer treats that as "metrics unavailable".

use std::time::Duration;

/// One sample over the probe window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessMetrics {
    /// CPU usage over the window, percent of one core.
    pub cpu_percent: f32,
    /// Resident set size in bytes.
    pub rss_bytes: u64,
    /// Bytes received across the process's interfaces.
    pub net_rx_bytes: u64,
    /// Bytes transmitted across the process's interfaces.
    pub net_tx_bytes: u64,
}

/// Samples process metrics from `/proc`.
#[derive(Debug, Default)]
pub struct ProcessProbe;

impl ProcessProbe {
    /// Samples the PID over `window`, sleeping for the window in between
    /// the two CPU reads. Returns `None` when the process is gone or the
    /// platform exposes no `/proc`.
    pub async fn sample(pid: u32, window: Duration) -> Option<ProcessMetrics> {
        #[cfg(target_os = "linux")]
        {
            linux::sample(pid, window).await
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (pid, window);
            None
        }
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::ProcessMetrics;
    use std::time::Duration;

    // USER_HZ; 100 on every mainstream kernel configuration.
    const CLK_TCK: f32 = 100.0;

    pub async fn sample(pid: u32, window: Duration) -> Option<ProcessMetrics> {
        let jiffies_before = cpu_jiffies(pid)?;
        tokio::time::sleep(window).await;
        let jiffies_after = cpu_jiffies(pid)?;

        let window_secs = window.as_secs_f32().max(f32::EPSILON);
        let delta = jiffies_after.saturating_sub(jiffies_before) as f32;
        let cpu_percent = (delta / CLK_TCK) / window_secs * 100.0;

        let rss_bytes = rss_bytes(pid)?;
        let (net_rx_bytes, net_tx_bytes) = net_bytes(pid).unwrap_or((0, 0));

        Some(ProcessMetrics {
            cpu_percent,
            rss_bytes,
            net_rx_bytes,
            net_tx_bytes,
        })
    }

    /// utime + stime from `/proc/<pid>/stat`.
    fn cpu_jiffies(pid: u32) -> Option<u64> {
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        // The comm field may contain spaces; fields resume after the last ')'.
        let (_, rest) = stat.rsplit_once(')')?;
        let fields: Vec<&str> = rest.split_whitespace().collect();
        // utime and stime are stat fields 14 and 15; `rest` starts at field 3.
        let utime: u64 = fields.get(11)?.parse().ok()?;
        let stime: u64 = fields.get(12)?.parse().ok()?;
        Some(utime + stime)
    }

    /// VmRSS from `/proc/<pid>/status`, reported in kB.
    fn rss_bytes(pid: u32) -> Option<u64> {
        let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
        let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
        let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some(kb * 1024)
    }

    /// Summed rx/tx bytes from `/proc/<pid>/net/dev`.
    fn net_bytes(pid: u32) -> Option<(u64, u64)> {
        let dev = std::fs::read_to_string(format!("/proc/{pid}/net/dev")).ok()?;
        let mut rx = 0u64;
        let mut tx = 0u64;
        for line in dev.lines().skip(2) {
            let (_, counters) = line.split_once(':')?;
            let fields: Vec<&str> = counters.split_whitespace().collect();
            rx += fields.first()?.parse::<u64>().ok()?;
            tx += fields.get(8)?.parse::<u64>().ok()?;
        }
        Some((rx, tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[cfg(target_os = "linux")]
    async fn test_sample_own_process() {
        let metrics = ProcessProbe::sample(std::process::id(), Duration::from_millis(50))
            .await
            .expect("own process should be sampleable");
        assert!(metrics.rss_bytes > 0);
        assert!(metrics.cpu_percent >= 0.0);
    }

    #[tokio::test]
    async fn test_sample_missing_pid_is_none() {
        // PID 0 is the idle task and has no /proc entry usable this way;
        // a large unused PID behaves the same.
        let metrics = ProcessProbe::sample(u32::MAX - 7, Duration::from_millis(10)).await;
        assert!(metrics.is_none());
    }
}
