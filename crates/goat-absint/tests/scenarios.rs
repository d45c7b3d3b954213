use std::collections::BTreeSet;

use goat_absint::value::AbstractValue;
use goat_absint::{
    analyze, AnalysisContext, AnalysisOptions, AnalysisResult, Block, Classification, Goro,
    PanicReason, TransitionKind, WorklistOrder,
};
use goat_cfg::SyncOp;
use goat_ir::builder::{ProgramBuilder, SelectArm, T_BOOL, T_CHAN_INT, T_INT, T_MUTEX, T_PTR_MUTEX, T_UNIT};
use goat_ir::Program;
use goat_lattice::Lattice;
use goat_upfront::{FragmentPolicy, ProgramFacts, UpfrontOptions};

fn run(program: &Program, policy: FragmentPolicy, options: &AnalysisOptions) -> Vec<AnalysisResult> {
    let facts = ProgramFacts::compute(program, UpfrontOptions::default());
    let main = program.func_id("main.main").unwrap();
    let entry_facts = facts.entry(program, main);
    entry_facts
        .psets(program, &facts, policy)
        .iter()
        .map(|pset| {
            let ctx = AnalysisContext::new(program, &facts, &entry_facts, pset, options);
            analyze(&ctx).unwrap()
        })
        .collect()
}

fn blocks(program: &Program) -> Vec<Block> {
    run(program, FragmentPolicy::Total, &AnalysisOptions::default())
        .into_iter()
        .flat_map(|r| r.blocks)
        .collect()
}

/// Every (operation, line) a block reports as stuck.
fn stuck_lines(blocks: &[Block]) -> BTreeSet<(String, u32)> {
    blocks
        .iter()
        .flat_map(|b| &b.blocked)
        .map(|g| (g.operation.clone(), g.span.as_ref().map_or(0, |s| s.start_line)))
        .collect()
}

/// `go func() { ch <- 1; ...; ch <- n }()` followed by `receives` receives.
fn sender_receiver(sends: i64, receives: usize) -> Program {
    let mut b = ProgramBuilder::new();
    b.closure("main.main$1", &[], &[("ch", T_CHAN_INT)], |f| {
        let ch = f.free_var(0);
        for n in 1..=sends {
            let v = f.int(n);
            f.send(ch, v);
        }
        f.ret(&[]);
    });
    b.func("main.main", &[], |f| {
        let ch = f.make_chan(0);
        let worker = f.make_closure("main.main$1", &[ch]);
        f.go_value(worker, &[]);
        for _ in 0..receives {
            f.recv(ch);
        }
        f.ret(&[]);
    });
    b.build()
}

/// cockroach#584: `bootstrap` and `manage` lock the gossip mutex in a loop
/// and the buggy version breaks out without unlocking.
fn gossip(fixed: bool) -> Program {
    let mut b = ProgramBuilder::new();
    let gossip = b.struct_type("main.Gossip", &[("mu", T_MUTEX), ("closed", T_BOOL)]);
    let ptr_gossip = b.pointer_type(gossip);
    let ptr_bool = b.pointer_type(T_BOOL);
    for method in ["bootstrap", "manage"] {
        b.func(&format!("(*main.Gossip).{method}"), &[("g", ptr_gossip)], |f| {
            let g = f.param(0);
            let head = f.new_block();
            let done = f.new_block();
            let again = f.new_block();
            f.jump(head);
            f.switch_to(head);
            let mu = f.field_addr(g, "mu", T_PTR_MUTEX);
            f.lock(mu);
            let closed_addr = f.field_addr(g, "closed", ptr_bool);
            let closed = f.load(closed_addr, T_BOOL);
            f.branch(closed, done, again);
            f.switch_to(done);
            if fixed {
                f.unlock(mu);
            }
            f.ret(&[]);
            f.switch_to(again);
            f.unlock(mu);
            f.jump(head);
        });
    }
    b.closure("main.main$1", &[], &[("g", ptr_gossip)], |f| {
        let g = f.free_var(0);
        f.call("(*main.Gossip).bootstrap", &[g], T_UNIT);
        f.call("(*main.Gossip).manage", &[g], T_UNIT);
        f.ret(&[]);
    });
    b.func("main.main", &[], |f| {
        let g = f.alloc(ptr_gossip);
        let closed_addr = f.field_addr(g, "closed", ptr_bool);
        let t = f.bool(true);
        f.store(closed_addr, t);
        let worker = f.make_closure("main.main$1", &[g]);
        f.go_value(worker, &[]);
        f.ret(&[]);
    });
    b.build()
}

/// `wg.Add(1); go func() { ch <- 1; wg.Done() }(); wg.Wait(); <-ch`
fn wait_before_receive() -> Program {
    let mut b = ProgramBuilder::new();
    let ptr_wg = goat_ir::builder::T_PTR_WAITGROUP;
    b.closure("main.main$1", &[], &[("ch", T_CHAN_INT), ("wg", ptr_wg)], |f| {
        let ch = f.free_var(0);
        let wg = f.free_var(1);
        let one = f.int(1);
        f.send(ch, one);
        f.wg_done(wg);
        f.ret(&[]);
    });
    b.func("main.main", &[], |f| {
        let ch = f.make_chan(0);
        let wg = f.new_wait_group();
        f.wg_add(wg, 1);
        let worker = f.make_closure("main.main$1", &[ch, wg]);
        f.go_value(worker, &[]);
        f.wg_wait(wg);
        f.recv(ch);
        f.ret(&[]);
    });
    b.build()
}

#[test]
fn test_handoff_to_spawned_sender_does_not_block() {
    assert!(blocks(&sender_receiver(1, 1)).is_empty());
}

#[test]
fn test_receive_without_sender_leaks_main() {
    let mut b = ProgramBuilder::new();
    b.func("main.main", &[], |f| {
        let ch = f.make_chan(0);
        f.recv(ch);
        f.ret(&[]);
    });
    let found = blocks(&b.build());
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].classification, Classification::Leak);
    assert_eq!(found[0].blocked.len(), 1);
    assert_eq!(found[0].blocked[0].operation, "receive");
    assert!(found[0].blocked[0].goroutine.contains("main.main"));
}

#[test]
fn test_second_send_leaks_spawned_goroutine() {
    let found = blocks(&sender_receiver(2, 1));
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].classification, Classification::Leak);
    assert_eq!(found[0].blocked[0].operation, "send");
    assert!(found[0].blocked[0].goroutine.contains("main.main$1"));
}

#[test]
fn test_double_lock_is_a_self_deadlock() {
    let mut b = ProgramBuilder::new();
    b.func("main.main", &[], |f| {
        let mu = f.new_mutex();
        f.lock(mu);
        f.lock(mu);
        f.ret(&[]);
    });
    let found = blocks(&b.build());
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].classification, Classification::Deadlock);
    assert_eq!(found[0].blocked[0].operation, "Lock");
}

#[test]
fn test_send_on_closed_channel_is_a_panic_not_a_block() {
    let mut b = ProgramBuilder::new();
    b.func("main.main", &[], |f| {
        let ch = f.make_chan(0);
        f.close(ch);
        let one = f.int(1);
        f.send(ch, one);
        f.ret(&[]);
    });
    let results = run(&b.build(), FragmentPolicy::Total, &AnalysisOptions::default());
    assert!(results.iter().all(|r| r.blocks.is_empty()));
    let reasons: Vec<PanicReason> = results
        .iter()
        .flat_map(|r| &r.panics)
        .map(|p| p.reason)
        .collect();
    assert_eq!(reasons, vec![PanicReason::SendOnClosed]);
}

#[test]
fn test_select_with_default_never_blocks() {
    let mut b = ProgramBuilder::new();
    b.func("main.main", &[], |f| {
        let ch1 = f.make_chan(0);
        let ch2 = f.make_chan(0);
        f.select(&[SelectArm::Recv(ch1), SelectArm::Recv(ch2)], false);
        f.ret(&[]);
    });
    assert!(blocks(&b.build()).is_empty());
}

#[test]
fn test_blocking_select_without_partner_leaks() {
    let mut b = ProgramBuilder::new();
    b.func("main.main", &[], |f| {
        let ch1 = f.make_chan(0);
        let ch2 = f.make_chan(0);
        f.select(&[SelectArm::Recv(ch1), SelectArm::Recv(ch2)], true);
        f.ret(&[]);
    });
    let found = blocks(&b.build());
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].blocked[0].operation, "select");
}

#[test]
fn test_cond_wait_without_signal_leaks() {
    let mut b = ProgramBuilder::new();
    b.func("main.main", &[], |f| {
        let mu = f.new_mutex();
        let cond = f.new_cond(mu);
        f.lock(mu);
        f.cond_wait(cond);
        f.unlock(mu);
        f.ret(&[]);
    });
    let found = blocks(&b.build());
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].classification, Classification::Leak);
    assert_eq!(found[0].blocked[0].operation, "Cond.Wait");
}

#[test]
fn test_signal_releases_waiter() {
    let mut b = ProgramBuilder::new();
    b.closure("main.main$1", &[], &[("mu", T_PTR_MUTEX), ("c", goat_ir::builder::T_PTR_COND)], |f| {
        let mu = f.free_var(0);
        let cond = f.free_var(1);
        f.lock(mu);
        f.signal(cond);
        f.unlock(mu);
        f.ret(&[]);
    });
    b.func("main.main", &[], |f| {
        let mu = f.new_mutex();
        let cond = f.new_cond(mu);
        f.lock(mu);
        let worker = f.make_closure("main.main$1", &[mu, cond]);
        f.go_value(worker, &[]);
        f.cond_wait(cond);
        f.unlock(mu);
        f.ret(&[]);
    });
    // The worker can only lock after main parks in Wait, so the signal
    // always finds it.
    assert!(blocks(&b.build()).is_empty());
}

#[test]
fn test_gossip_missing_unlock_blocks_on_lock() {
    let found = blocks(&gossip(false));
    assert!(!found.is_empty());
    assert!(found
        .iter()
        .any(|b| b.blocked.iter().any(|g| g.operation == "Lock")));
}

#[test]
fn test_gossip_with_unlock_does_not_block() {
    assert!(blocks(&gossip(true)).is_empty());
}

#[test]
fn test_wait_group_wait_before_receive_deadlocks() {
    let found = blocks(&wait_before_receive());
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].classification, Classification::Deadlock);
    let ops: BTreeSet<&str> = found[0].blocked.iter().map(|g| g.operation.as_str()).collect();
    assert_eq!(ops, BTreeSet::from(["WaitGroup.Wait", "send"]));
}

#[test]
fn test_receive_from_closed_channel_proceeds() {
    let mut b = ProgramBuilder::new();
    b.closure("main.main$1", &[], &[("ch", T_CHAN_INT)], |f| {
        let ch = f.free_var(0);
        f.recv_ok(ch);
        f.ret(&[]);
    });
    b.func("main.main", &[], |f| {
        let ch = f.make_chan(0);
        let worker = f.make_closure("main.main$1", &[ch]);
        f.go_value(worker, &[]);
        f.close(ch);
        f.ret(&[]);
    });
    assert!(blocks(&b.build()).is_empty());
}

#[test]
fn test_buffered_channel_absorbs_sends() {
    let mut b = ProgramBuilder::new();
    b.func("main.main", &[], |f| {
        let ch = f.make_chan(2);
        let one = f.int(1);
        f.send(ch, one);
        f.send(ch, one);
        let v = f.recv(ch);
        let _ = f.binop(goat_ir::ir::BinaryOp::Add, v, one, T_INT);
        f.ret(&[]);
    });
    assert!(blocks(&b.build()).is_empty());
}

#[test]
fn test_unbounded_spawn_in_loop_is_an_error() {
    let mut b = ProgramBuilder::new();
    b.closure("main.main$1", &[], &[("ch", T_CHAN_INT)], |f| {
        let ch = f.free_var(0);
        f.recv(ch);
        f.ret(&[]);
    });
    b.func("main.main", &[], |f| {
        let ch = f.make_chan(0);
        let head = f.new_block();
        f.jump(head);
        f.switch_to(head);
        let worker = f.make_closure("main.main$1", &[ch]);
        f.go_value(worker, &[]);
        f.jump(head);
    });
    let program = b.build();
    let facts = ProgramFacts::compute(&program, UpfrontOptions::default());
    let main = program.func_id("main.main").unwrap();
    let entry_facts = facts.entry(&program, main);
    let psets = entry_facts.psets(&program, &facts, FragmentPolicy::Total);
    let options = AnalysisOptions::default();
    let ctx = AnalysisContext::new(&program, &facts, &entry_facts, &psets[0], &options);
    let err = analyze(&ctx).unwrap_err();
    assert!(matches!(err, goat_absint::AnalysisError::UnboundedSpawn { bound: 3, .. }));
}

#[test]
fn test_worklist_order_does_not_change_the_fixpoint() {
    for program in [sender_receiver(2, 1), gossip(false), wait_before_receive()] {
        let fifo = AnalysisOptions {
            order: WorklistOrder::Fifo,
            ..AnalysisOptions::default()
        };
        let lifo = AnalysisOptions {
            order: WorklistOrder::Lifo,
            ..AnalysisOptions::default()
        };
        let a = run(&program, FragmentPolicy::Total, &fifo);
        let b = run(&program, FragmentPolicy::Total, &lifo);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.graph.states, y.graph.states);
            assert_eq!(stuck_lines(&x.blocks), stuck_lines(&y.blocks));
        }
    }
}

#[test]
fn test_smaller_fragments_report_no_extra_blocks() {
    for program in [sender_receiver(2, 1), gossip(false), wait_before_receive()] {
        let options = AnalysisOptions::default();
        let total: Vec<Block> = run(&program, FragmentPolicy::Total, &options)
            .into_iter()
            .flat_map(|r| r.blocks)
            .collect();
        let total = stuck_lines(&total);
        for policy in FragmentPolicy::ALL {
            let found: Vec<Block> = run(&program, policy, &options)
                .into_iter()
                .flat_map(|r| r.blocks)
                .collect();
            assert!(
                stuck_lines(&found).is_subset(&total),
                "{policy} reported a block the total fragment does not"
            );
        }
    }
}

#[test]
fn test_transitions_are_monotone_in_memory() {
    for program in [sender_receiver(1, 1), sender_receiver(2, 1)] {
        let facts = ProgramFacts::compute(&program, UpfrontOptions::default());
        let main = program.func_id("main.main").unwrap();
        let entry_facts = facts.entry(&program, main);
        let psets = entry_facts.psets(&program, &facts, FragmentPolicy::Total);
        let options = AnalysisOptions::default();
        let ctx = AnalysisContext::new(&program, &facts, &entry_facts, &psets[0], &options);
        let graph = ctx.explore().unwrap().graph;
        let big = graph
            .states
            .values()
            .fold(goat_absint::state::State::bottom(), |acc, s| acc.join(s));
        for (sl, small) in &graph.states {
            let low = ctx.transitions(*sl, small).unwrap();
            let high = ctx.transitions(*sl, &big).unwrap();
            for step in low.iter().filter(|s| s.transition.panic.is_none()) {
                let matched = high.iter().any(|h| {
                    h.moves == step.moves
                        && h.transition.kind == step.transition.kind
                        && step.state.leq(&h.state)
                });
                assert!(matched, "no larger counterpart for {:?} at {sl:?}", step.transition);
            }
        }
    }
}

fn panics(results: &[AnalysisResult]) -> Vec<PanicReason> {
    results.iter().flat_map(|r| &r.panics).map(|p| p.reason).collect()
}

#[test]
fn test_goexit_ends_the_goroutine_before_its_receive() {
    let mut b = ProgramBuilder::new();
    b.closure("main.main$1", &[], &[("ch", T_CHAN_INT)], |f| {
        let ch = f.free_var(0);
        f.call("runtime.Goexit", &[], T_UNIT);
        f.recv(ch);
        f.ret(&[]);
    });
    b.func("main.main", &[], |f| {
        let ch = f.make_chan(0);
        let worker = f.make_closure("main.main$1", &[ch]);
        f.go_value(worker, &[]);
        f.ret(&[]);
    });
    let results = run(&b.build(), FragmentPolicy::Total, &AnalysisOptions::default());
    assert!(results.iter().all(|r| r.blocks.is_empty()));
    assert!(panics(&results).is_empty());
}

/// `go func() { defer wg.Done(); t.Fatal(); <-never }(); wg.Wait(); <-ch`
#[test]
fn test_failed_test_runs_deferred_done_and_terminates() {
    let mut b = ProgramBuilder::new();
    let ptr_wg = goat_ir::builder::T_PTR_WAITGROUP;
    b.closure("main.main$1", &[], &[("wg", ptr_wg), ("never", T_CHAN_INT)], |f| {
        let wg = f.free_var(0);
        let never = f.free_var(1);
        f.defer("(*sync.WaitGroup).Done", &[wg]);
        f.call("(*testing.common).Fatal", &[], T_UNIT);
        f.recv(never);
        f.run_defers();
        f.ret(&[]);
    });
    b.func("main.main", &[], |f| {
        let wg = f.new_wait_group();
        let never = f.make_chan(0);
        let ch = f.make_chan(0);
        f.wg_add(wg, 1);
        let worker = f.make_closure("main.main$1", &[wg, never]);
        f.go_value(worker, &[]);
        f.wg_wait(wg);
        f.recv(ch);
        f.ret(&[]);
    });
    let results = run(&b.build(), FragmentPolicy::Total, &AnalysisOptions::default());
    let found: Vec<Block> = results.iter().flat_map(|r| r.blocks.clone()).collect();
    // Only main's final receive is stuck; the worker neither blocks nor
    // crashes the program.
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].blocked.len(), 1);
    assert_eq!(found[0].blocked[0].operation, "receive");
    assert!(found[0].blocked[0].goroutine.contains("main.main"));
    assert!(!found[0].blocked[0].goroutine.contains("main.main$1"));
    assert!(panics(&results).is_empty());
}

#[test]
fn test_time_after_delivers_exactly_once() {
    for (receives, stuck) in [(1, 0), (2, 1)] {
        let mut b = ProgramBuilder::new();
        b.func("main.main", &[], |f| {
            let d = f.int(1000);
            let timeout = f.call("time.After", &[d], T_CHAN_INT);
            for _ in 0..receives {
                f.recv(timeout);
            }
            f.ret(&[]);
        });
        assert_eq!(blocks(&b.build()).len(), stuck, "{receives} receives");
    }
}

fn timer_receives(constructor: &str, receives: usize) -> Program {
    let mut b = ProgramBuilder::new();
    let name = constructor.trim_start_matches("time.New");
    let timer = b.struct_type(&format!("time.{name}"), &[("C", T_CHAN_INT)]);
    let ptr_timer = b.pointer_type(timer);
    let ptr_chan = b.pointer_type(T_CHAN_INT);
    b.func("main.main", &[], |f| {
        let d = f.int(1000);
        let t = f.call(constructor, &[d], ptr_timer);
        let c = f.field_addr(t, "C", ptr_chan);
        let ch = f.load(c, T_CHAN_INT);
        for _ in 0..receives {
            f.recv(ch);
        }
        f.ret(&[]);
    });
    b.build()
}

#[test]
fn test_timer_fires_once_and_ticker_keeps_ticking() {
    assert!(blocks(&timer_receives("time.NewTimer", 1)).is_empty());
    let found = blocks(&timer_receives("time.NewTimer", 2));
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].blocked[0].operation, "receive");
    assert!(blocks(&timer_receives("time.NewTicker", 3)).is_empty());
}

#[test]
fn test_read_lock_excludes_writer() {
    let mut b = ProgramBuilder::new();
    b.func("main.main", &[], |f| {
        let rw = f.new_rw_mutex();
        f.rlock(rw);
        f.rw_lock(rw);
        f.ret(&[]);
    });
    let found = blocks(&b.build());
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].classification, Classification::Deadlock);
    assert_eq!(found[0].blocked[0].operation, "Lock");

    let mut b = ProgramBuilder::new();
    b.func("main.main", &[], |f| {
        let rw = f.new_rw_mutex();
        f.rlock(rw);
        f.runlock(rw);
        f.rw_lock(rw);
        f.rw_unlock(rw);
        f.ret(&[]);
    });
    assert!(blocks(&b.build()).is_empty());
}

fn rlocker(then_write_lock: bool) -> Program {
    let mut b = ProgramBuilder::new();
    let t_locker = goat_ir::builder::T_LOCKER;
    b.func("main.main", &[], |f| {
        let rw = f.new_rw_mutex();
        let l = f.call("(*sync.RWMutex).RLocker", &[rw], t_locker);
        f.invoke(l, "Lock", &[], T_UNIT);
        // A second reader is admitted.
        f.rlock(rw);
        f.runlock(rw);
        if then_write_lock {
            f.rw_lock(rw);
        }
        f.invoke(l, "Unlock", &[], T_UNIT);
        f.rw_lock(rw);
        f.ret(&[]);
    });
    b.build()
}

#[test]
fn test_rlocker_takes_the_read_lock() {
    assert!(blocks(&rlocker(false)).is_empty());
    let found = blocks(&rlocker(true));
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].classification, Classification::Deadlock);
    assert_eq!(found[0].blocked[0].operation, "Lock");
}

#[test]
fn test_atomic_value_hands_channel_to_worker() {
    let mut b = ProgramBuilder::new();
    let ptr_value = goat_ir::builder::T_PTR_INT;
    b.closure("main.main$1", &[], &[("v", ptr_value)], |f| {
        let v = f.free_var(0);
        let ch = f.call("(*sync/atomic.Value).Load", &[v], T_CHAN_INT);
        let one = f.int(1);
        f.send(ch, one);
        f.ret(&[]);
    });
    b.func("main.main", &[], |f| {
        let v = f.alloc(ptr_value);
        let ch = f.make_chan(0);
        f.call("(*sync/atomic.Value).Store", &[v, ch], T_UNIT);
        let worker = f.make_closure("main.main$1", &[v]);
        f.go_value(worker, &[]);
        f.recv(ch);
        f.ret(&[]);
    });
    assert!(blocks(&b.build()).is_empty());
}

#[test]
fn test_frontier_configurations_are_not_reported_after_deadline() {
    let mut b = ProgramBuilder::new();
    b.func("main.main", &[], |f| {
        let ch = f.make_chan(0);
        f.recv(ch);
        f.ret(&[]);
    });
    let program = b.build();
    let rushed = AnalysisOptions {
        deadline: Some(std::time::Duration::from_nanos(1)),
        ..AnalysisOptions::default()
    };
    let results = run(&program, FragmentPolicy::Total, &rushed);
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert!(result.timed_out);
    // The stuck receive was queued but never expanded.
    assert!(!result.graph.frontier.is_empty());
    assert!(result.graph.frontier.iter().all(|sl| result.graph.states.contains_key(sl)));
    assert!(result.blocks.is_empty());
    assert!(result.metrics.superlocations >= 1);

    assert_eq!(blocks(&program).len(), 1);
}

#[test]
fn test_close_of_nil_channel_panics() {
    let mut b = ProgramBuilder::new();
    b.func("main.main", &[], |f| {
        let ch = f.make_chan(0);
        let none = f.nil(T_CHAN_INT);
        f.close(none);
        f.recv(ch);
        f.ret(&[]);
    });
    let results = run(&b.build(), FragmentPolicy::Total, &AnalysisOptions::default());
    let reasons: BTreeSet<PanicReason> = results
        .iter()
        .flat_map(|r| &r.panics)
        .map(|p| p.reason)
        .collect();
    assert_eq!(reasons, BTreeSet::from([PanicReason::CloseOfNil]));
    // The receive after the panic is never reached.
    assert!(results.iter().all(|r| r.blocks.is_empty()));
}

#[test]
fn test_blocked_lock_names_its_holder() {
    let mut b = ProgramBuilder::new();
    b.func("main.main", &[], |f| {
        let mu = f.new_mutex();
        f.lock(mu);
        f.lock(mu);
        f.ret(&[]);
    });
    let found = blocks(&b.build());
    assert_eq!(found.len(), 1);
    let stuck = &found[0].blocked[0];
    assert_eq!(stuck.holders, vec![stuck.goroutine.clone()]);
}

/// Waiter sets of the condition-variable records in a state.
fn cond_waiters(state: &goat_absint::state::State) -> Vec<Vec<Goro>> {
    state
        .memory
        .heap()
        .filter_map(|(_, v)| match v {
            AbstractValue::Cond(c) => Some(c.waiters.iter().copied().collect()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_cond_records_queue_and_release_waiters() {
    let mut b = ProgramBuilder::new();
    b.closure("main.main$1", &[], &[("mu", T_PTR_MUTEX), ("c", goat_ir::builder::T_PTR_COND)], |f| {
        let mu = f.free_var(0);
        let cond = f.free_var(1);
        f.lock(mu);
        f.signal(cond);
        f.unlock(mu);
        f.ret(&[]);
    });
    b.func("main.main", &[], |f| {
        let mu = f.new_mutex();
        let cond = f.new_cond(mu);
        f.lock(mu);
        let worker = f.make_closure("main.main$1", &[mu, cond]);
        f.go_value(worker, &[]);
        f.cond_wait(cond);
        f.unlock(mu);
        f.ret(&[]);
    });
    let program = b.build();
    let main = Goro::root(program.func_id("main.main").unwrap());
    let results = run(&program, FragmentPolicy::Total, &AnalysisOptions::default());
    let graph = &results
        .iter()
        .find(|r| r.graph.states.values().any(|s| !cond_waiters(s).is_empty()))
        .unwrap()
        .graph;

    assert!(graph
        .states
        .values()
        .any(|s| cond_waiters(s).iter().any(|w| w == &vec![main])));
    let signalled: Vec<_> = graph
        .edges
        .iter()
        .filter(|e| e.transition.kind == TransitionKind::Sync(SyncOp::Signal))
        .collect();
    assert!(!signalled.is_empty());
    for edge in signalled {
        assert!(edge.transition.progressed.contains(&main));
        assert!(cond_waiters(&graph.states[&edge.to]).iter().all(|w| w.is_empty()));
    }
}
