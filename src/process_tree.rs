/// Process tree discovery.
///
/// A tree is built from a fresh process table on every call. Process
/// identities and parent links change between samples, so nothing is cached.
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use sysinfo::{Pid, System};

/// One process and its descendants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessTree {
    pub pid: u32,
    pub name: String,
    pub exe: String,
    pub num_threads: usize,
    pub cmdline: String,
    pub children: Vec<ProcessTree>,
}

impl ProcessTree {
    /// Refresh the process table and build the tree rooted at `root_pid`.
    pub fn load(root_pid: u32) -> Result<Self, TreeError> {
        let mut system = System::new();
        system.refresh_processes();
        Self::from_system(&system, root_pid)
    }

    /// Build the tree from an already refreshed process table.
    pub fn from_system(system: &System, root_pid: u32) -> Result<Self, TreeError> {
        let mut children_of: HashMap<u32, Vec<u32>> = HashMap::new();
        for (pid, process) in system.processes() {
            if let Some(parent) = process.parent() {
                // On Linux the table also lists threads, parented to their process.
                let is_thread = system
                    .process(parent)
                    .and_then(|p| p.tasks())
                    .is_some_and(|tasks| tasks.contains(pid));
                if is_thread {
                    continue;
                }
                children_of
                    .entry(parent.as_u32())
                    .or_default()
                    .push(pid.as_u32());
            }
        }
        for kids in children_of.values_mut() {
            kids.sort_unstable();
        }

        let mut seen = HashSet::new();
        Self::build(system, &children_of, root_pid, &mut seen)
            .ok_or(TreeError::NotFound { pid: root_pid })
    }

    fn build(
        system: &System,
        children_of: &HashMap<u32, Vec<u32>>,
        pid: u32,
        seen: &mut HashSet<u32>,
    ) -> Option<Self> {
        // Pid reuse can produce parent cycles in a racing snapshot.
        if !seen.insert(pid) {
            return None;
        }
        let process = system.process(Pid::from_u32(pid))?;
        let children = children_of
            .get(&pid)
            .map(|kids| {
                kids.iter()
                    .filter_map(|&kid| Self::build(system, children_of, kid, seen))
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            pid,
            name: process.name().to_string(),
            exe: process
                .exe()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            num_threads: process.tasks().map_or(1, |t| t.len().max(1)),
            cmdline: process.cmd().join(" "),
            children,
        })
    }

    /// Pids in pre-order: root first, then each subtree.
    pub fn flattened_pids(&self) -> Vec<u32> {
        let mut pids = vec![self.pid];
        for child in &self.children {
            pids.extend(child.flattened_pids());
        }
        pids
    }

    /// Pids in post-order: every descendant before its ancestors, root last.
    pub fn kill_order(&self) -> Vec<u32> {
        let mut pids = Vec::new();
        for child in &self.children {
            pids.extend(child.kill_order());
        }
        pids.push(self.pid);
        pids
    }
}

#[derive(Debug)]
pub enum TreeError {
    NotFound { pid: u32 },
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TreeError::NotFound { pid } => write!(f, "process with pid {pid} not found"),
        }
    }
}

impl std::error::Error for TreeError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(pid: u32, children: Vec<ProcessTree>) -> ProcessTree {
        ProcessTree {
            pid,
            name: format!("p{pid}"),
            exe: String::new(),
            num_threads: 1,
            cmdline: String::new(),
            children,
        }
    }

    #[test]
    fn test_flattened_pids_pre_order() {
        let tree = node(1, vec![node(2, vec![node(4, vec![])]), node(3, vec![])]);
        assert_eq!(tree.flattened_pids(), vec![1, 2, 4, 3]);
    }

    #[test]
    fn test_kill_order_children_first() {
        let tree = node(1, vec![node(2, vec![node(4, vec![])]), node(3, vec![])]);
        assert_eq!(tree.kill_order(), vec![4, 2, 3, 1]);
    }

    #[test]
    fn test_serializes_camel_case() {
        let tree = node(7, vec![]);
        let json = serde_json::to_value(&tree).unwrap();
        assert_eq!(json["pid"], 7);
        assert_eq!(json["numThreads"], 1);
        assert!(json["children"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_load_current_process() {
        let me = std::process::id();
        let tree = ProcessTree::load(me).unwrap();
        assert_eq!(tree.pid, me);
        assert!(!tree.name.is_empty());
    }

    #[test]
    fn test_load_missing_pid() {
        let err = ProcessTree::load(u32::MAX - 1).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[cfg(unix)]
    #[test]
    fn test_load_sees_spawned_child() {
        let mut child = std::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .unwrap();
        let child_pid = child.id();

        let tree = ProcessTree::load(std::process::id()).unwrap();
        let found = tree.flattened_pids().contains(&child_pid);

        child.kill().unwrap();
        child.wait().unwrap();
        assert!(found);
    }
}
