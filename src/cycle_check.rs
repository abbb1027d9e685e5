use std::collections::{HashMap, HashSet};
use crate::Task;

pub fn has_cycle(tasks: &HashMap<String, Task>) -> bool {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();

    fn dfs<'a>(
        task_id: &'a str,
        tasks: &'a HashMap<String, Task>,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut HashSet<&'a str>,
    ) -> bool {
        if rec_stack.contains(task_id) {
            return true;
        }
        if visited.contains(task_id) {
            return false;
        }

        visited.insert(task_id);
        rec_stack.insert(task_id);

        if let Some(task) = tasks.get(task_id) {
            for dep in &task.dependencies {
                if dfs(dep, tasks, visited, rec_stack) {
                    return true;
                }
            }
        }

        rec_stack.remove(task_id);
        false
    }

    tasks
        .keys()
        .any(|task_id| !visited.contains(task_id.as_str()) && dfs(task_id, tasks, &mut visited, &mut rec_stack))
}

/// Whether `from` reaches `target` by following dependency edges. A task
/// reaches itself.
pub fn depends_on(tasks: &HashMap<String, Task>, from: &str, target: &str) -> bool {
    let mut visited = HashSet::new();
    let mut stack = vec![from];

    while let Some(task_id) = stack.pop() {
        if task_id == target {
            return true;
        }
        if !visited.insert(task_id) {
            continue;
        }
        if let Some(task) = tasks.get(task_id) {
            stack.extend(task.dependencies.iter().map(String::as_str));
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Schedule;
    use std::time::Duration;

    fn graph(edges: &[(&str, &[&str])]) -> HashMap<String, Task> {
        edges
            .iter()
            .map(|(id, deps)| {
                let task = Task::new(*id, *id, Schedule::Interval(Duration::from_secs(60)))
                    .with_dependencies(deps.iter().copied());
                (id.to_string(), task)
            })
            .collect()
    }

    #[test]
    fn acyclic_graph() {
        let tasks = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a", "b"])]);
        assert!(!has_cycle(&tasks));
    }

    #[test]
    fn detects_cycle() {
        let tasks = graph(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"])]);
        assert!(has_cycle(&tasks));
    }

    #[test]
    fn detects_self_loop() {
        let tasks = graph(&[("a", &["a"])]);
        assert!(has_cycle(&tasks));
    }

    #[test]
    fn dangling_dependency_is_not_a_cycle() {
        let tasks = graph(&[("a", &["missing"])]);
        assert!(!has_cycle(&tasks));
    }

    #[test]
    fn reachability() {
        let tasks = graph(&[("a", &[]), ("b", &["a"]), ("c", &["b"]), ("d", &[])]);
        assert!(depends_on(&tasks, "c", "a"));
        assert!(depends_on(&tasks, "a", "a"));
        assert!(!depends_on(&tasks, "a", "c"));
        assert!(!depends_on(&tasks, "d", "a"));
    }
}
