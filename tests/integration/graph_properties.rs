//! Dependency graph property tests.
//!
//! Graphs are generated from seeded random number generators, so every run
//! checks the same inputs. Edges only point from lower to higher task
//! numbers, which keeps the generated graphs acyclic.

use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use maestro::core::{DependencyGraph, DependencyType, Task, TaskId};
use maestro::Error;

const SEEDS: std::ops::Range<u64> = 0..32;

fn id(i: usize) -> TaskId {
    TaskId::new(format!("t{}", i))
}

/// Random DAG with up to 40 tasks; each pair `(j, i)` with `j < i` becomes
/// an edge with the given probability.
fn random_dag(rng: &mut StdRng, density: f64) -> (DependencyGraph, Vec<(usize, usize)>) {
    let n = rng.gen_range(1..=40);
    let mut edges = Vec::new();
    let tasks: Vec<Task> = (0..n)
        .map(|i| {
            let deps: Vec<usize> = (0..i).filter(|_| rng.gen_bool(density)).collect();
            edges.extend(deps.iter().map(|&j| (j, i)));
            Task::new(id(i), "default").depends_on(deps.into_iter().map(id))
        })
        .collect();
    (DependencyGraph::from_tasks(tasks).unwrap(), edges)
}

fn level_of(graph: &DependencyGraph) -> HashMap<TaskId, usize> {
    let mut levels = HashMap::new();
    for level in graph.topological_levels().unwrap() {
        for task in level.tasks {
            assert!(levels.insert(task, level.index).is_none(), "task placed twice");
        }
    }
    levels
}

/// Test: Levels are a layered topological order
/// Given random acyclic graphs
/// When they are leveled
/// Then every task appears in exactly one level, every dependency sits in a
/// strictly earlier level, and every task past level 0 has a dependency in
/// the level right before it
#[test]
fn test_levels_form_topological_layers() {
    for seed in SEEDS {
        let mut rng = StdRng::seed_from_u64(seed);
        let (graph, edges) = random_dag(&mut rng, 0.15);
        let levels = level_of(&graph);

        assert_eq!(levels.len(), graph.task_count(), "seed {}", seed);
        for &(dep, task) in &edges {
            assert!(levels[&id(dep)] < levels[&id(task)], "seed {}", seed);
        }
        for task in graph.task_ids() {
            let level = levels[&task];
            if level > 0 {
                assert!(
                    graph
                        .dependencies(&task)
                        .iter()
                        .any(|(dep, _)| levels[dep] == level - 1),
                    "seed {}: {} could run earlier",
                    seed,
                    task
                );
            }
        }
    }
}

/// Test: Levels keep definition order
/// Given random graphs
/// When they are leveled
/// Then the tasks inside each level appear in the order they were defined
#[test]
fn test_levels_preserve_definition_order() {
    for seed in SEEDS {
        let mut rng = StdRng::seed_from_u64(seed);
        let (graph, _) = random_dag(&mut rng, 0.1);
        for level in graph.topological_levels().unwrap() {
            let numbers: Vec<usize> = level
                .tasks
                .iter()
                .map(|t| t.as_str()[1..].parse().unwrap())
                .collect();
            let mut sorted = numbers.clone();
            sorted.sort_unstable();
            assert_eq!(numbers, sorted, "seed {}", seed);
        }
    }
}

/// Test: Rejected edges leave the graph untouched
/// Given random graphs
/// When a backward edge that closes a cycle is added, together with a
/// dependency on a brand new task
/// Then the call fails with CyclicDependency and the nodes, edges and
/// levels are exactly as before
#[test]
fn test_cycle_insertion_rolls_back() {
    let mut checked = 0;
    for seed in SEEDS {
        let mut rng = StdRng::seed_from_u64(seed);
        let (mut graph, edges) = random_dag(&mut rng, 0.2);
        let Some(&(from, to)) = edges.first() else {
            continue;
        };

        let nodes_before = graph.task_count();
        let edges_before = graph.dependency_count();
        let levels_before = graph.topological_levels().unwrap();

        // `to` already depends on `from`; making `from` depend on `to` closes the loop.
        let err = graph
            .add_dependency(&id(from), &[TaskId::from("newcomer"), id(to)], DependencyType::Hard)
            .unwrap_err();
        assert!(matches!(err, Error::CyclicDependency { .. }), "seed {}", seed);

        assert_eq!(graph.task_count(), nodes_before, "seed {}", seed);
        assert_eq!(graph.dependency_count(), edges_before, "seed {}", seed);
        assert!(!graph.contains(&TaskId::from("newcomer")));
        assert!(!graph.has_dependency(&id(to), &id(from)));
        assert_eq!(graph.topological_levels().unwrap(), levels_before);
        checked += 1;
    }
    assert!(checked > 0);
}

/// Test: Accepted forward edges keep the graph acyclic
/// Given random graphs
/// When random forward edges are added one at a time
/// Then every insertion succeeds and the graph still levels
#[test]
fn test_forward_edges_are_accepted() {
    for seed in SEEDS {
        let mut rng = StdRng::seed_from_u64(seed);
        let (mut graph, _) = random_dag(&mut rng, 0.05);
        let n = graph.task_count();
        if n < 2 {
            continue;
        }
        for _ in 0..20 {
            let a = rng.gen_range(0..n - 1);
            let b = rng.gen_range(a + 1..n);
            graph
                .add_dependency(&id(b), &[id(a)], DependencyType::Soft)
                .unwrap();
        }
        assert_eq!(level_of(&graph).len(), n);
    }
}

/// Test: Transitive dependents follow hard edges
/// Given random graphs with all-hard edges
/// When the transitive dependents of each task are computed
/// Then they equal the set of tasks reachable along the generated edges
#[test]
fn test_hard_dependents_match_reachability() {
    for seed in SEEDS {
        let mut rng = StdRng::seed_from_u64(seed);
        let (graph, edges) = random_dag(&mut rng, 0.1);
        let mut successors: HashMap<usize, Vec<usize>> = HashMap::new();
        for &(from, to) in &edges {
            successors.entry(from).or_default().push(to);
        }

        for start in 0..graph.task_count() {
            let mut expected = HashSet::new();
            let mut stack = vec![start];
            while let Some(node) = stack.pop() {
                for &next in successors.get(&node).into_iter().flatten() {
                    if expected.insert(id(next)) {
                        stack.push(next);
                    }
                }
            }
            let actual: HashSet<TaskId> =
                graph.hard_dependents_transitive(&id(start)).into_iter().collect();
            assert_eq!(actual, expected, "seed {} start {}", seed, start);
        }
    }
}

/// Test: Two-task cycle
/// Given X depends on Y
/// When Y is made to depend on X
/// Then it is rejected and only the first edge remains
#[test]
fn test_two_task_cycle_rejected() {
    let mut graph = DependencyGraph::new();
    let x = TaskId::from("X");
    let y = TaskId::from("Y");

    graph
        .add_dependency(&x, &[y.clone()], DependencyType::Hard)
        .unwrap();
    let err = graph
        .add_dependency(&y, &[x.clone()], DependencyType::Hard)
        .unwrap_err();

    assert!(matches!(err, Error::CyclicDependency { task_id } if task_id == y));
    assert_eq!(graph.task_count(), 2);
    assert_eq!(graph.dependency_count(), 1);
    assert!(graph.has_dependency(&y, &x));
    assert!(!graph.has_dependency(&x, &y));
}
