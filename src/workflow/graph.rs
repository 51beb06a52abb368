//! 计划依赖图
//!
//! 邻接表 + 入度表，按层做 Kahn 拓扑排序：每一层就是一个波次。
//! 只有计划内的依赖构成边，指向之前轮次已完成任务的依赖视为已满足。

use std::collections::{BTreeMap, BTreeSet};

use crate::workflow::types::{Task, TaskId, WorkflowError};

pub struct DependencyGraph {
    /// 任务 ID -> 依赖它的任务
    adjacency: BTreeMap<TaskId, Vec<TaskId>>,
    /// 任务 ID -> 计划内未满足的依赖数
    in_degree: BTreeMap<TaskId, usize>,
}

impl DependencyGraph {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let tasks: Vec<&Task> = tasks.into_iter().collect();
        let ids: BTreeSet<TaskId> = tasks.iter().map(|t| t.id).collect();

        let mut adjacency: BTreeMap<TaskId, Vec<TaskId>> = BTreeMap::new();
        let mut in_degree: BTreeMap<TaskId, usize> = BTreeMap::new();
        for id in &ids {
            adjacency.insert(*id, Vec::new());
            in_degree.insert(*id, 0);
        }
        for task in &tasks {
            for dep in task.dependencies.iter().filter(|d| ids.contains(d)) {
                adjacency.entry(*dep).or_default().push(task.id);
                *in_degree.entry(task.id).or_insert(0) += 1;
            }
        }
        Self { adjacency, in_degree }
    }

    /// 分层拓扑排序；有环时返回环上（及被环阻塞）的任务
    pub fn waves(&self) -> Result<Vec<Vec<TaskId>>, WorkflowError> {
        let mut in_degree = self.in_degree.clone();
        let mut current: Vec<TaskId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut waves = Vec::new();
        let mut visited = 0usize;

        while !current.is_empty() {
            visited += current.len();
            let mut next = BTreeSet::new();
            for id in &current {
                for dependent in self.adjacency.get(id).into_iter().flatten() {
                    if let Some(d) = in_degree.get_mut(dependent) {
                        *d -= 1;
                        if *d == 0 {
                            next.insert(*dependent);
                        }
                    }
                }
            }
            waves.push(std::mem::take(&mut current));
            current = next.into_iter().collect();
        }

        if visited < in_degree.len() {
            let pending = in_degree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(id, _)| *id)
                .collect();
            return Err(WorkflowError::CyclicDependency { pending });
        }
        Ok(waves)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::TaskSpec;

    fn tasks(specs: &[(TaskId, &[TaskId])]) -> Vec<Task> {
        specs
            .iter()
            .map(|(id, deps)| Task::from(TaskSpec::new(*id, "t", "A", deps)))
            .collect()
    }

    #[test]
    fn test_waves_follow_longest_chain() {
        let ts = tasks(&[(1, &[]), (2, &[]), (3, &[1]), (4, &[3, 2]), (5, &[])]);
        let graph = DependencyGraph::from_tasks(&ts);
        assert_eq!(graph.waves().unwrap(), vec![vec![1, 2, 5], vec![3], vec![4]]);
    }

    #[test]
    fn test_cycle_reports_blocked_tasks() {
        let ts = tasks(&[(1, &[]), (2, &[3]), (3, &[2]), (4, &[3])]);
        let err = DependencyGraph::from_tasks(&ts).waves().unwrap_err();
        assert_eq!(err, WorkflowError::CyclicDependency { pending: vec![2, 3, 4] });
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let ts = tasks(&[(1, &[1])]);
        assert!(DependencyGraph::from_tasks(&ts).waves().is_err());
    }

    #[test]
    fn test_external_dependencies_ignored() {
        let ts = tasks(&[(7, &[3])]);
        assert_eq!(DependencyGraph::from_tasks(&ts).waves().unwrap(), vec![vec![7]]);
    }
}
