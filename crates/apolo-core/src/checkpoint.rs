//! Capture / restore checkpoints
//!
//! Risky trials (a chain of debits, a multi-account charge) snapshot the
//! mutable part of their state first and either commit or roll back to it.

/// State that can be captured and later put back
pub trait Snapshot {
    type State: Clone;

    /// Copies the mutable part of `self`
    fn capture(&self) -> Self::State;

    /// Puts a previously captured state back
    fn restore(&mut self, state: Self::State);
}

/// A slice snapshots element-wise
impl<T: Snapshot> Snapshot for [T] {
    type State = Vec<T::State>;

    fn capture(&self) -> Self::State {
        self.iter().map(Snapshot::capture).collect()
    }

    fn restore(&mut self, state: Self::State) {
        for (item, s) in self.iter_mut().zip(state) {
            item.restore(s);
        }
    }
}

/// A captured state waiting to be either restored or dropped
#[derive(Debug, Clone)]
#[must_use = "a checkpoint must be restored or committed"]
pub struct Checkpoint<S> {
    state: S,
}

impl<S: Clone> Checkpoint<S> {
    /// Captures the current state of `target`
    pub fn capture<T>(target: &T) -> Self
    where
        T: Snapshot<State = S> + ?Sized,
    {
        Self {
            state: target.capture(),
        }
    }

    /// Rolls `target` back, keeping the checkpoint for later trials
    pub fn restore_to<T>(&self, target: &mut T)
    where
        T: Snapshot<State = S> + ?Sized,
    {
        target.restore(self.state.clone());
    }

    /// Rolls `target` back and consumes the checkpoint
    pub fn rollback<T>(self, target: &mut T)
    where
        T: Snapshot<State = S> + ?Sized,
    {
        target.restore(self.state);
    }

    /// Accepts the current state
    pub fn commit(self) {}

    /// Captured state
    pub fn state(&self) -> &S {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(Vec<i64>);

    impl Snapshot for Counter {
        type State = Vec<i64>;

        fn capture(&self) -> Vec<i64> {
            self.0.clone()
        }

        fn restore(&mut self, state: Vec<i64>) {
            self.0 = state;
        }
    }

    #[test]
    fn test_restore_keeps_checkpoint() {
        let mut c = Counter(vec![1, 2]);
        let cp = Checkpoint::capture(&c);
        c.0[0] = 10;
        cp.restore_to(&mut c);
        assert_eq!(c.0, vec![1, 2]);
        c.0[1] = 20;
        cp.rollback(&mut c);
        assert_eq!(c.0, vec![1, 2]);
    }

    #[test]
    fn test_slice_checkpoint() {
        let mut items = vec![Counter(vec![1]), Counter(vec![2])];
        let cp = Checkpoint::capture(&items[..]);
        items[0].0[0] = 7;
        items[1].0.push(3);
        cp.rollback(&mut items[..]);
        assert_eq!(items[0].0, vec![1]);
        assert_eq!(items[1].0, vec![2]);
    }

    #[test]
    fn test_commit_keeps_changes() {
        let mut c = Counter(vec![5]);
        let cp = Checkpoint::capture(&c);
        c.0[0] = 3;
        cp.commit();
        assert_eq!(c.0, vec![3]);
    }
}
