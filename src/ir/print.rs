//! Deterministic textual form of a [`Function`].
//!
//! Downstream caches key on printed IR, so the format depends only on
//! arena order, never on addresses or hash iteration. Two structurally
//! identical functions print byte-identically.

use std::fmt;

use super::{Function, InstKind, Ty, ValueId, ValueKind};

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Ty::RcPtr => "rcptr",
            Ty::Ptr => "ptr",
            Ty::Int => "int",
            Ty::Bool => "bool",
            Ty::ExcPair => "excpair",
            Ty::Unit => "unit",
        };
        f.write_str(s)
    }
}

impl Function {
    fn fmt_value(&self, f: &mut fmt::Formatter<'_>, v: ValueId) -> fmt::Result {
        match self.value(v) {
            ValueKind::Arg { .. } | ValueKind::Inst { .. } => write!(f, "v{}", v.raw()),
            ValueKind::Global { name, .. } | ValueKind::Func { name } => write!(f, "@{name}"),
            ValueKind::NullPtr => f.write_str("null"),
            ValueKind::ConstInt(k) => write!(f, "{k}"),
        }
    }

    fn fmt_args(&self, f: &mut fmt::Formatter<'_>, args: &[ValueId]) -> fmt::Result {
        for (i, &a) in args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            self.fmt_value(f, a)?;
        }
        Ok(())
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn @{}(", self.name)?;
        let mut first = true;
        for (i, kind) in self.values.iter().enumerate() {
            if let ValueKind::Arg { ty, .. } = kind {
                if !first {
                    f.write_str(", ")?;
                }
                first = false;
                write!(f, "v{i}: {ty}")?;
            }
        }
        f.write_str(")")?;
        if let Some(p) = self.personality() {
            write!(f, " personality @{p}")?;
        }
        f.write_str(" {\n")?;

        for (bi, block) in self.blocks.iter().enumerate() {
            writeln!(f, "bb{bi}:")?;
            for &id in &block.insts {
                let inst = &self.insts[id.index()];
                f.write_str("  ")?;
                if let Some(r) = inst.result {
                    write!(f, "v{} = ", r.raw())?;
                }
                match &inst.kind {
                    InstKind::Phi { incoming } => {
                        f.write_str("phi ")?;
                        for (i, (pred, v)) in incoming.iter().enumerate() {
                            if i > 0 {
                                f.write_str(", ")?;
                            }
                            write!(f, "[bb{}: ", pred.raw())?;
                            self.fmt_value(f, *v)?;
                            f.write_str("]")?;
                        }
                    }
                    InstKind::Call { callee, args } => {
                        f.write_str("call ")?;
                        self.fmt_value(f, *callee)?;
                        f.write_str("(")?;
                        self.fmt_args(f, args)?;
                        f.write_str(")")?;
                    }
                    InstKind::Invoke {
                        callee,
                        args,
                        normal,
                        unwind,
                    } => {
                        f.write_str("invoke ")?;
                        self.fmt_value(f, *callee)?;
                        f.write_str("(")?;
                        self.fmt_args(f, args)?;
                        write!(f, ") to bb{} unwind bb{}", normal.raw(), unwind.raw())?;
                    }
                    InstKind::LandingPad => f.write_str("landingpad catch-all")?,
                    InstKind::ExtractValue { agg, index } => {
                        f.write_str("extractvalue ")?;
                        self.fmt_value(f, *agg)?;
                        write!(f, ", {index}")?;
                    }
                    InstKind::Alloca => f.write_str("alloca")?,
                    InstKind::Cast { src } => {
                        f.write_str("cast ")?;
                        self.fmt_value(f, *src)?;
                    }
                    InstKind::FieldAddr { base, word_offset } => {
                        f.write_str("fieldaddr ")?;
                        self.fmt_value(f, *base)?;
                        write!(f, ", {word_offset}")?;
                    }
                    InstKind::Load { ptr } => {
                        f.write_str("load ")?;
                        self.fmt_value(f, *ptr)?;
                    }
                    InstKind::Store { value, ptr } => {
                        f.write_str("store ")?;
                        self.fmt_value(f, *value)?;
                        f.write_str(", ")?;
                        self.fmt_value(f, *ptr)?;
                    }
                    InstKind::Add { lhs, rhs } => {
                        f.write_str("add ")?;
                        self.fmt_value(f, *lhs)?;
                        f.write_str(", ")?;
                        self.fmt_value(f, *rhs)?;
                    }
                    InstKind::IcmpEq { lhs, rhs } => {
                        f.write_str("icmp eq ")?;
                        self.fmt_value(f, *lhs)?;
                        f.write_str(", ")?;
                        self.fmt_value(f, *rhs)?;
                    }
                    InstKind::Patchpoint { id, size, value } => {
                        write!(f, "patchpoint id={id} size={size} (")?;
                        self.fmt_value(f, *value)?;
                        f.write_str(")")?;
                    }
                    InstKind::Br { target } => write!(f, "br bb{}", target.raw())?,
                    InstKind::CondBr {
                        cond,
                        then_dest,
                        else_dest,
                    } => {
                        f.write_str("condbr ")?;
                        self.fmt_value(f, *cond)?;
                        write!(f, ", bb{}, bb{}", then_dest.raw(), else_dest.raw())?;
                    }
                    InstKind::Ret { value } => {
                        f.write_str("ret")?;
                        if let Some(v) = value {
                            f.write_str(" ")?;
                            self.fmt_value(f, *v)?;
                        }
                    }
                    InstKind::Unreachable => f.write_str("unreachable")?,
                }
                f.write_str("\n")?;
            }
        }
        f.write_str("}\n")
    }
}
