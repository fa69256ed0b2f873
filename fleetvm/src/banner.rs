//! The startup banner (§6): one stdout line announcing a successful boot.

use crate::vm::PollMethod;

/// Data needed to render the §6 banner line.
#[derive(Debug, Clone)]
pub struct StartupBanner {
    pub program: String,
    pub poll_method: PollMethod,
    pub vm_count: u16,
    pub ephemeral: bool,
    pub ephemeral_keep_working_memory: bool,
    pub hugepages: bool,
    pub transparent_hugepages: bool,
    pub init_ms: u64,
    pub warmup_ms: Option<u64>,
    pub rss_mib: u64,
}

impl StartupBanner {
    /// Renders `Program '<path>' loaded. <poll_method> vm=<N>[
    /// ephemeral[-kwm]] huge=<0|1>/<0|1> init=<ms>ms[ warmup=<ms>ms]
    /// rss=<MiB>MB` exactly (§6).
    pub fn render(&self) -> String {
        let poll_method = match self.poll_method {
            PollMethod::Poll => "poll",
            PollMethod::Epoll => "epoll",
            PollMethod::Blocking => "blocking",
        };

        let mut line = format!("Program '{}' loaded. {poll_method} vm={}", self.program, self.vm_count);

        if self.ephemeral {
            line.push_str(" ephemeral");
            if self.ephemeral_keep_working_memory {
                line.push_str("-kwm");
            }
        }

        line.push_str(&format!(" huge={}/{}", self.hugepages as u8, self.transparent_hugepages as u8));
        line.push_str(&format!(" init={}ms", self.init_ms));
        if let Some(warmup_ms) = self.warmup_ms {
            line.push_str(&format!(" warmup={warmup_ms}ms"));
        }
        line.push_str(&format!(" rss={}MB", self.rss_mib));
        line
    }
}

/// Best-effort RSS reading from `/proc/self/statm` (§6 "process-level
/// bootstrap... `/proc/self/statm` reporting" is an out-of-scope
/// collaborator; this is the banner's own minimal consumer of it). Returns
/// 0 if unavailable, e.g. on a non-Linux host running the test suite.
pub fn current_rss_mib() -> u64 {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0;
    };
    let Some(resident_pages) = statm.split_whitespace().nth(1).and_then(|s| s.parse::<u64>().ok()) else {
        return 0;
    };
    let page_size = 4096u64;
    (resident_pages * page_size) / (1024 * 1024)
}
