// Process tree discovery and termination
use std::collections::HashMap;

use log::debug;
use sysinfo::{Pid, ProcessRefreshKind, System};

/// All descendants of `root`, deepest first, not including `root` itself
pub fn descendants(root: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessRefreshKind::new());

    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    // Breadth-first walk, then reverse so grandchildren come before children
    let mut ordered = Vec::new();
    let mut frontier = vec![Pid::from_u32(root)];
    while let Some(pid) = frontier.pop() {
        if let Some(kids) = children.get(&pid) {
            for kid in kids {
                if !ordered.contains(kid) {
                    ordered.push(*kid);
                    frontier.push(*kid);
                }
            }
        }
    }
    ordered.reverse();
    ordered.into_iter().map(|pid| pid.as_u32()).collect()
}

/// Kill every descendant of `root` (children first), then `root` itself.
/// Returns how many processes were signaled.
pub fn kill_process_tree(root: u32) -> usize {
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessRefreshKind::new());

    let mut killed = 0;
    for pid in descendants(root).into_iter().chain(std::iter::once(root)) {
        if let Some(process) = system.process(Pid::from_u32(pid)) {
            if process.kill() {
                debug!("Killed process {}", pid);
                killed += 1;
            }
        }
    }
    killed
}
