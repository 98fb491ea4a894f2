//! Property tests for dependency levels and topological order.

use std::collections::{HashMap, HashSet};

use proptest::prelude::*;

use conductor::core::{TaskDag, TaskDefinition, TaskRegistry};

// Acyclic by construction: task N may only depend on tasks 0..N-1.
fn registry_strategy(max_tasks: usize) -> impl Strategy<Value = TaskRegistry> {
    (1..=max_tasks).prop_flat_map(|num_tasks| {
        proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..4), num_tasks)
            .prop_map(|raw_deps| {
                let definitions = raw_deps
                    .into_iter()
                    .enumerate()
                    .map(|(i, potential)| {
                        let deps: HashSet<String> = potential
                            .into_iter()
                            .filter(|_| i > 0)
                            .map(|d| format!("task_{}", d % i))
                            .collect();
                        let mut def = TaskDefinition::new(&format!("task_{}", i), format!("{}.md", i));
                        def.depends_on = deps.into_iter().collect();
                        def
                    })
                    .collect();
                TaskRegistry::new(definitions).unwrap()
            })
    })
}

proptest! {
    #[test]
    fn test_levels_cover_every_task_once(registry in registry_strategy(12)) {
        let dag = TaskDag::new(&registry);
        let levels = dag.dependency_levels(registry.names()).unwrap();

        let flat: Vec<&String> = levels.iter().flatten().collect();
        let unique: HashSet<&String> = flat.iter().copied().collect();
        prop_assert_eq!(flat.len(), registry.len());
        prop_assert_eq!(unique.len(), registry.len());
        prop_assert!(levels.iter().all(|level| !level.is_empty()));
    }

    #[test]
    fn test_dependencies_sit_in_earlier_levels(registry in registry_strategy(12)) {
        let dag = TaskDag::new(&registry);
        let levels = dag.dependency_levels(registry.names()).unwrap();
        let level_of: HashMap<&str, usize> = levels
            .iter()
            .enumerate()
            .flat_map(|(i, level)| level.iter().map(move |name| (name.as_str(), i)))
            .collect();

        for def in registry.definitions() {
            let own = level_of[def.name.as_str()];
            for dep in &def.depends_on {
                prop_assert!(level_of[dep.as_str()] < own);
            }
            // Each task sits at the earliest level its dependencies allow.
            if own > 0 {
                prop_assert!(def.depends_on.iter().any(|dep| level_of[dep.as_str()] == own - 1));
            }
        }
    }

    #[test]
    fn test_topological_order_respects_dependencies(registry in registry_strategy(12)) {
        let dag = TaskDag::new(&registry);
        let order = dag.topological_sort(registry.names()).unwrap();
        let position: HashMap<&str, usize> =
            order.iter().enumerate().map(|(i, name)| (name.as_str(), i)).collect();

        prop_assert_eq!(order.len(), registry.len());
        for def in registry.definitions() {
            for dep in &def.depends_on {
                prop_assert!(position[dep.as_str()] < position[def.name.as_str()]);
            }
        }
    }

    #[test]
    fn test_expansion_is_dependency_closed(registry in registry_strategy(12), pick in any::<usize>()) {
        let dag = TaskDag::new(&registry);
        let target = &registry.names()[pick % registry.len()];
        let expanded = dag.expand_with_dependencies(&[target.as_str()]).unwrap();
        let set: HashSet<&str> = expanded.iter().map(String::as_str).collect();

        prop_assert!(set.contains(target.as_str()));
        for name in &expanded {
            for dep in &registry.get(name).unwrap().depends_on {
                prop_assert!(set.contains(dep.as_str()));
            }
        }
    }
}
