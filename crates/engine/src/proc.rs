//! Process-tree accounting via `/proc`.
//!
//! One scan per monitor tick covers every supervised job: the table of
//! (pid, ppid, cpu ticks, rss) is read once, then each job's tree is walked
//! from its root pid. Descendants are included so a script that forks
//! compilers or workers is charged for the whole tree.

use std::collections::HashMap;
use std::io;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy)]
struct ProcStat {
    ppid: u32,
    /// utime + stime, in clock ticks.
    cpu_ticks: u64,
    rss_pages: u64,
}

/// Aggregate usage of one process tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TreeUsage {
    pub rss_bytes: u64,
    pub cpu_ticks: u64,
    pub processes: usize,
}

/// A point-in-time scan of every process on the host.
#[derive(Debug)]
pub(crate) struct ProcScan {
    stats: HashMap<u32, ProcStat>,
    children: HashMap<u32, Vec<u32>>,
}

impl ProcScan {
    pub(crate) fn capture() -> io::Result<Self> {
        let mut stats = HashMap::new();
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();

        for entry in std::fs::read_dir("/proc")? {
            let entry = entry?;
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            // Processes may exit mid-scan; skip the ones that did.
            let Ok(content) = std::fs::read_to_string(entry.path().join("stat")) else {
                continue;
            };
            let Some(stat) = parse_stat(&content) else {
                continue;
            };
            children.entry(stat.ppid).or_default().push(pid);
            stats.insert(pid, stat);
        }

        Ok(Self { stats, children })
    }

    /// Usage of `root` plus all its live descendants, or `None` when the
    /// root process no longer exists.
    pub(crate) fn tree_usage(&self, root: u32) -> Option<TreeUsage> {
        self.stats.get(&root)?;

        let mut usage = TreeUsage {
            rss_bytes: 0,
            cpu_ticks: 0,
            processes: 0,
        };
        let mut queue = vec![root];
        while let Some(pid) = queue.pop() {
            let Some(stat) = self.stats.get(&pid) else {
                continue;
            };
            usage.processes += 1;
            usage.cpu_ticks += stat.cpu_ticks;
            usage.rss_bytes += stat.rss_pages * page_size();
            if let Some(kids) = self.children.get(&pid) {
                queue.extend(kids.iter().copied());
            }
        }
        Some(usage)
    }
}

/// Parse a `/proc/[pid]/stat` line. The comm field may contain spaces and
/// parentheses, so fields are counted from the last `)`.
fn parse_stat(content: &str) -> Option<ProcStat> {
    let rest = content.rsplit_once(')')?.1;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // After comm, fields are 1-based from 3: state(3) ppid(4) ... utime(14)
    // stime(15) ... rss(24), i.e. offsets 1, 11, 12, and 21 here.
    let ppid = fields.get(1)?.parse().ok()?;
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let rss_pages = fields.get(21)?.parse().ok()?;
    Some(ProcStat {
        ppid,
        cpu_ticks: utime + stime,
        rss_pages,
    })
}

pub(crate) fn page_size() -> u64 {
    static PAGE_SIZE: OnceLock<u64> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // sysconf cannot fail for _SC_PAGESIZE on Linux; fall back anyway.
        let value = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        u64::try_from(value).unwrap_or(4096)
    })
}

/// Kernel clock ticks per second, for converting stat ticks to seconds.
pub(crate) fn clock_ticks_per_sec() -> u64 {
    static CLK_TCK: OnceLock<u64> = OnceLock::new();
    *CLK_TCK.get_or_init(|| {
        let value = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        u64::try_from(value).unwrap_or(100)
    })
}
