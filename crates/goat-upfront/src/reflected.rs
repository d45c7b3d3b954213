//! Channels that escape into `reflect.ValueOf`.
//!
//! Reflection may operate on such channels in ways the interpreter cannot
//! follow, so they are dropped from every P-set and read as top.

use std::collections::BTreeSet;

use tracing::debug;

use goat_ir::ir::{Callee, Op, ValueId};
use goat_ir::points_to::PointsTo;
use goat_ir::Program;

use crate::primitives::Primitives;

pub const REFLECT_VALUE_OF: &str = "reflect.ValueOf";

/// Channel allocation sites flowing directly into `reflect.ValueOf`.
/// Channels reaching it through struct fields are not considered.
pub fn reflected_channels(
    program: &Program,
    points_to: &PointsTo,
    primitives: &Primitives,
) -> BTreeSet<ValueId> {
    let mut out = BTreeSet::new();
    let is_chan_site = |site: &ValueId| primitives.get(*site).is_some_and(|p| p.kind.is_chan());
    for (_, func) in program.functions() {
        for instr in func.instructions() {
            let (Op::Call { call } | Op::Go { call } | Op::Defer { call }) = &instr.op else {
                continue;
            };
            if !matches!(&call.callee, Callee::Static { func } if func == REFLECT_VALUE_OF) {
                continue;
            }
            let [arg] = call.args.as_slice() else {
                continue;
            };
            // The argument is an interface; look through its construction.
            let inner = match program.instruction(*arg).map(|i| &i.op) {
                Some(Op::MakeInterface { x }) => *x,
                _ => *arg,
            };
            if !program.types.is_chan(program.value_type(inner)) && inner != *arg {
                continue;
            }
            out.extend(
                primitives
                    .of_value(points_to, inner)
                    .into_iter()
                    .filter(|s| is_chan_site(s)),
            );
        }
    }
    if !out.is_empty() {
        debug!(count = out.len(), "channels escape into reflection");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use goat_ir::builder::{ProgramBuilder, T_INT};

    #[test]
    fn test_channel_passed_to_value_of_is_reflected() {
        let mut b = ProgramBuilder::new();
        b.mark_stdlib("reflect");
        b.external(REFLECT_VALUE_OF);
        let (mut reflected, mut plain) = (0, 0);
        b.func("main.main", &[], |f| {
            reflected = f.make_chan(0);
            plain = f.make_chan(0);
            let any = f.push(T_INT, Op::MakeInterface { x: reflected });
            f.call(REFLECT_VALUE_OF, &[any], T_INT);
            f.ret(&[]);
        });
        let p = b.build();
        let pts = PointsTo::estimate(&p);
        let prims = Primitives::collect(&p);
        assert_eq!(
            reflected_channels(&p, &pts, &prims),
            BTreeSet::from([reflected])
        );
    }
}
