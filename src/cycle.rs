//! Cycle detection over the "waiting on" relation of stuck tasks.

use std::hash::Hash;

use ahash::AHashMap;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnPath,
    Finished,
}

/// Find cycles reachable from `starts` by depth-first search over `edges`.
///
/// Each cycle is returned in edge order, starting at the first member the search entered.
/// Every node is visited once, so overlapping cycles may be reported partially; callers
/// re-run detection if nodes remain stuck.
pub(crate) fn find_cycles<N, E, I>(starts: impl IntoIterator<Item = N>, mut edges: E) -> Vec<Vec<N>>
where
    N: Copy + Eq + Hash,
    E: FnMut(N) -> I,
    I: IntoIterator<Item = N>,
{
    let mut marks: AHashMap<N, Mark> = AHashMap::default();
    let mut cycles = Vec::new();

    for start in starts {
        if marks.contains_key(&start) {
            continue;
        }
        marks.insert(start, Mark::OnPath);
        let mut path = vec![start];
        let mut frames = vec![edges(start).into_iter().collect::<Vec<_>>().into_iter()];

        loop {
            let Some(frame) = frames.last_mut() else {
                break;
            };
            let Some(next) = frame.next() else {
                frames.pop();
                if let Some(done) = path.pop() {
                    marks.insert(done, Mark::Finished);
                }
                continue;
            };
            match marks.get(&next) {
                None => {
                    marks.insert(next, Mark::OnPath);
                    path.push(next);
                    frames.push(edges(next).into_iter().collect::<Vec<_>>().into_iter());
                }
                Some(Mark::OnPath) => {
                    if let Some(position) = path.iter().position(|node| *node == next) {
                        cycles.push(path[position..].to_vec());
                    }
                }
                Some(Mark::Finished) => {}
            }
        }
    }
    cycles
}

/// The cycle as seen from its member at `start`.
pub(crate) fn rotated<T: Clone>(cycle: &[T], start: usize) -> Vec<T> {
    cycle[start..].iter().chain(&cycle[..start]).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(u32, u32)]) -> impl FnMut(u32) -> Vec<u32> + '_ {
        move |node| {
            edges
                .iter()
                .filter(|(from, _)| *from == node)
                .map(|(_, to)| *to)
                .collect()
        }
    }

    #[test]
    fn test_two_node_cycle() {
        let edges = [(1, 2), (2, 1)];
        assert_eq!(find_cycles([1], graph(&edges)), vec![vec![1, 2]]);
    }

    #[test]
    fn test_self_cycle() {
        let edges = [(7, 7)];
        assert_eq!(find_cycles([7], graph(&edges)), vec![vec![7]]);
    }

    #[test]
    fn test_path_into_cycle() {
        let edges = [(0, 1), (1, 2), (2, 3), (3, 1)];
        assert_eq!(find_cycles([0], graph(&edges)), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn test_acyclic() {
        let edges = [(0, 1), (0, 2), (1, 3), (2, 3)];
        assert!(find_cycles([0, 1, 2, 3], graph(&edges)).is_empty());
    }

    #[test]
    fn test_disjoint_cycles_from_later_starts() {
        let edges = [(1, 2), (2, 1), (5, 6), (6, 5)];
        let cycles = find_cycles([1, 5], graph(&edges));
        assert_eq!(cycles, vec![vec![1, 2], vec![5, 6]]);
    }

    #[test]
    fn test_rotated() {
        assert_eq!(rotated(&['a', 'b', 'c'], 1), vec!['b', 'c', 'a']);
        assert_eq!(rotated(&['a'], 0), vec!['a']);
    }
}
