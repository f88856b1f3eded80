//! Property tests for heap ordering under insertion, removal and update.

use proptest::prelude::*;
use tcprelay_pqueue::UpdateablePriorityQueue;

fn drain(queue: &mut UpdateablePriorityQueue<i64>) -> Vec<i64> {
    std::iter::from_fn(|| queue.poll()).collect()
}

proptest! {
    #[test]
    fn poll_is_non_decreasing(values in prop::collection::vec(any::<i64>(), 0..200)) {
        let mut queue = UpdateablePriorityQueue::new();
        for v in &values {
            queue.add(*v);
        }

        let mut expected = values.clone();
        expected.sort();
        prop_assert_eq!(drain(&mut queue), expected);
    }

    #[test]
    fn arbitrary_removal_keeps_order(
        values in prop::collection::vec(-1000i64..1000, 1..120),
        picks in prop::collection::vec(any::<prop::sample::Index>(), 0..60),
    ) {
        let mut queue = UpdateablePriorityQueue::new();
        let refs: Vec<_> = values.iter().map(|v| queue.add(*v)).collect();

        let mut removed = vec![false; values.len()];
        for pick in picks {
            let i = pick.index(values.len());
            let result = queue.remove(refs[i]);
            if removed[i] {
                prop_assert!(result.is_none());
            } else {
                prop_assert_eq!(result, Some(values[i]));
                removed[i] = true;
            }
        }

        let mut expected: Vec<i64> = values
            .iter()
            .zip(&removed)
            .filter(|(_, gone)| !**gone)
            .map(|(v, _)| *v)
            .collect();
        expected.sort();
        prop_assert_eq!(queue.len(), expected.len());
        prop_assert_eq!(drain(&mut queue), expected);
    }

    #[test]
    fn update_keeps_order(
        values in prop::collection::vec(-1000i64..1000, 1..120),
        updates in prop::collection::vec((any::<prop::sample::Index>(), -2000i64..2000), 0..60),
    ) {
        let mut queue = UpdateablePriorityQueue::new();
        let refs: Vec<_> = values.iter().map(|v| queue.add(*v)).collect();
        let mut current = values.clone();

        for (pick, new_value) in updates {
            let i = pick.index(values.len());
            prop_assert_eq!(queue.set_elem(refs[i], new_value), Ok(current[i]));
            current[i] = new_value;
            prop_assert_eq!(queue.peek().copied(), current.iter().min().copied());
        }

        current.sort();
        prop_assert_eq!(drain(&mut queue), current);
    }
}
