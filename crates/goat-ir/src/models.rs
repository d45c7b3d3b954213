//! Summaries of standard-library calls that create or drive concurrency
//! primitives.
//!
//! The bodies of these functions are never analyzed. Points-to estimation,
//! primitive collection and the abstract interpreter all consult this
//! table so they agree on what a modelled call allocates.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::ir::{CallCommon, Callee};

/// Constructor of condition variables; its result is an allocation site.
pub const NEW_COND: &str = "sync.NewCond";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Model {
    /// `sync.NewCond(l)`: a condition variable whose field `L` holds `l`.
    NewCond,
    /// `time.After(d)`: a channel of capacity 1 already holding a value.
    After,
    /// `time.NewTimer(d)`: a timer whose field `C` is a channel of
    /// capacity 1 already holding a value.
    NewTimer,
    /// `time.NewTicker(d)`: a ticker whose field `C` never blocks a
    /// receiver.
    NewTicker,
    /// `(*sync.RWMutex).RLocker()`: a locker over the receiver's read lock.
    RLocker,
    /// `(*sync/atomic.Value).Store(v)`
    AtomicStore,
    /// `(*sync/atomic.Value).Load()`
    AtomicLoad,
    /// `runtime.Goexit()` and the test-failure methods that call it: the
    /// goroutine runs its deferred calls and terminates.
    Goexit,
}

static MODELS: OnceLock<HashMap<String, Model>> = OnceLock::new();

fn models() -> &'static HashMap<String, Model> {
    MODELS.get_or_init(|| {
        let mut m = HashMap::new();
        let mut insert = |name: &str, model: Model| {
            m.insert(name.to_string(), model);
        };
        insert(NEW_COND, Model::NewCond);

        // time
        insert("time.After", Model::After);
        insert("time.NewTimer", Model::NewTimer);
        insert("time.NewTicker", Model::NewTicker);

        // sync
        insert("(*sync.RWMutex).RLocker", Model::RLocker);
        insert("(*sync/atomic.Value).Store", Model::AtomicStore);
        insert("(*sync/atomic.Value).Load", Model::AtomicLoad);

        // runtime and testing
        insert("runtime.Goexit", Model::Goexit);
        for recv in ["common", "T", "B"] {
            for method in ["FailNow", "Fatal", "Fatalf", "SkipNow", "Skip", "Skipf"] {
                insert(&format!("(*testing.{recv}).{method}"), Model::Goexit);
            }
        }
        m
    })
}

impl Model {
    /// Model of a function by its full name.
    pub fn of(name: &str) -> Option<Model> {
        models().get(name).copied()
    }

    /// Model of a statically dispatched call.
    pub fn of_call(call: &CallCommon) -> Option<Model> {
        match &call.callee {
            Callee::Static { func } => Model::of(func),
            _ => None,
        }
    }

    /// The call result is a fresh object allocated at the call site.
    pub fn allocates(self) -> bool {
        matches!(
            self,
            Model::NewCond | Model::After | Model::NewTimer | Model::NewTicker
        )
    }

    /// The call allocates a channel identified by the call site.
    pub fn makes_chan(self) -> bool {
        matches!(self, Model::After | Model::NewTimer | Model::NewTicker)
    }

    /// The channel lives in field `C` of the returned struct.
    pub fn chan_in_field(self) -> bool {
        matches!(self, Model::NewTimer | Model::NewTicker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_lookup_by_name() {
        assert_eq!(Model::of("time.After"), Some(Model::After));
        assert_eq!(Model::of("(*testing.common).Fatalf"), Some(Model::Goexit));
        assert_eq!(Model::of("(*testing.T).FailNow"), Some(Model::Goexit));
        assert_eq!(Model::of("(*testing.T).Log"), None);
        assert_eq!(Model::of("time.Sleep"), None);
        assert!(Model::NewTimer.makes_chan() && Model::NewTimer.chan_in_field());
        assert!(Model::After.makes_chan() && !Model::After.chan_in_field());
        assert!(!Model::RLocker.allocates());
    }

    #[test]
    fn test_only_static_calls_are_modelled() {
        let call = CallCommon {
            callee: Callee::Invoke {
                recv: 1,
                method: "Goexit".into(),
            },
            args: vec![],
        };
        assert_eq!(Model::of_call(&call), None);
    }
}
