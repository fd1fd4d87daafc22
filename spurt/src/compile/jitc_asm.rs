//! The baseline compiler: one operation per guest word, with intra-function jumps resolved to
//! word indices. It does no analysis of its own beyond decoding each word.

use super::{
    at, fall_back, CompilationError, CompiledFunction, Compiler, Exit, Exits, InnerEntries,
    InnerEntry, Target,
};
use crate::{
    analysis::{Analyser, Function, FunctionKey},
    isa::{decode, is_absolute, Cond, Insn, LS_MASK},
    runtime::{SpuFunction, SpuRuntime, ThunkHead},
    thread::SpuThread,
};
use std::{any::Any, sync::Arc};

pub(crate) struct AsmCompiler;

impl Compiler for AsmCompiler {
    fn name(&self) -> &'static str {
        "asm"
    }

    fn compile(
        &self,
        rt: &SpuRuntime,
        func: &Function,
        analysis: &Analyser,
    ) -> Result<Arc<dyn CompiledFunction>, CompilationError> {
        if analysis.entry() != func.entry {
            return Err(CompilationError::InternalError(format!(
                "Analysis describes {:#07x}, not {:#07x}",
                analysis.entry(),
                func.entry
            )));
        }
        let mut exits = Exits::new(rt);
        let mut ops = Vec::with_capacity(func.words.len());
        for (i, &w) in func.words.iter().enumerate() {
            let pos = func.entry + ((i as u32) << 2);
            let op = if w == 0 {
                Op::Hole
            } else {
                match decode(pos, w) {
                    Insn::Null => Op::Hole,
                    Insn::Nop => Op::Nop,
                    Insn::Plain | Insn::Const { .. } => Op::Plain(w),
                    Insn::Stop { code } => Op::Stop(code),
                    Insn::StopD => Op::Stop(0),
                    Insn::Iret => Op::Iret,
                    Insn::Br { target } => {
                        if target == pos + 4 {
                            Op::Nop
                        } else {
                            Op::Jump(target_of(func, &mut exits, w, target)?)
                        }
                    }
                    Insn::BrCond { cond, rt, target } => Op::Cond {
                        cond,
                        rt,
                        target: target_of(func, &mut exits, w, target)?,
                    },
                    Insn::BrSl { target, rt } => {
                        if target == pos + 4 {
                            Op::Link { rt }
                        } else {
                            Op::Call {
                                rt,
                                exit: exits.exit(target, !is_absolute(w))?,
                            }
                        }
                    }
                    Insn::Bi { ra } => Op::Indirect {
                        ra,
                        link: None,
                        cond: None,
                    },
                    Insn::BiSl { ra, rt } => Op::Indirect {
                        ra,
                        link: Some(rt),
                        cond: None,
                    },
                    Insn::BiCond { cond, rt, ra } => Op::Indirect {
                        ra,
                        link: None,
                        cond: Some((cond, rt)),
                    },
                }
            };
            ops.push(op);
        }
        let end_exit = match ops.last() {
            Some(op) if op.falls_through() => Some(exits.exit(
                at(func.entry, (func.words.len() as u32) << 2),
                true,
            )?),
            _ => None,
        };

        let body = Box::new(AsmBody {
            head: ThunkHead::new(exec_asm),
            entry: func.entry,
            key: Arc::clone(&func.words),
            ops,
            end_exit,
        });
        let code = rt.make_thunk(&body.head)?;
        let inner = InnerEntries::new(rt, analysis, &*body, exec_asm_inner, |off| {
            Some((off >> 2) as usize)
        })?;
        Ok(Arc::new(AsmFunction { body, code, inner }))
    }
}

/// Resolve a direct branch to `target`. Relative branches to code inside the function stay
/// inside the compiled body.
fn target_of(
    func: &Function,
    exits: &mut Exits<'_>,
    w: u32,
    target: u32,
) -> Result<Target, CompilationError> {
    if !is_absolute(w) && func.contains(target) && func.word(target) != 0 {
        Ok(Target::Local(((target - func.entry) >> 2) as usize))
    } else {
        Ok(Target::Exit(exits.exit(target, !is_absolute(w))?))
    }
}

#[derive(Copy, Clone, Debug)]
enum Op {
    /// A word analysis never reached: leave through the dispatch table if control gets here.
    Hole,
    Nop,
    /// A word executed by the thread's instruction handler.
    Plain(u32),
    /// `BRSL rt, +4`: `rt` = the address of the next word.
    Link { rt: u8 },
    Stop(u32),
    Jump(Target),
    Cond { cond: Cond, rt: u8, target: Target },
    Call { rt: u8, exit: Exit },
    Indirect {
        ra: u8,
        link: Option<u8>,
        cond: Option<(Cond, u8)>,
    },
    Iret,
}

impl Op {
    /// Can control continue with the next op?
    fn falls_through(&self) -> bool {
        match self {
            Op::Nop | Op::Plain(_) | Op::Link { .. } | Op::Cond { .. } => true,
            Op::Indirect { cond, .. } => cond.is_some(),
            Op::Hole | Op::Stop(_) | Op::Jump(_) | Op::Call { .. } | Op::Iret => false,
        }
    }
}

#[derive(Debug)]
#[repr(C)]
struct AsmBody {
    head: ThunkHead,
    /// The address this body was compiled for.
    entry: u32,
    key: FunctionKey,
    ops: Vec<Op>,
    /// Where control goes when it runs off the last op, if it can.
    end_exit: Option<Exit>,
}

#[derive(Debug)]
pub(crate) struct AsmFunction {
    body: Box<AsmBody>,
    code: SpuFunction,
    inner: InnerEntries<AsmBody>,
}

impl CompiledFunction for AsmFunction {
    fn entry(&self) -> SpuFunction {
        self.code
    }

    fn key(&self) -> &FunctionKey {
        &self.body.key
    }

    fn inner_entries(&self) -> &[(u32, SpuFunction)] {
        self.inner.code()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync + 'static> {
        self
    }
}

/// Run the [AsmBody] `rip` at the thread's `pc`.
unsafe extern "C" fn exec_asm(spu: *mut SpuThread, _ls: *mut u8, rip: *const u8) {
    let body = unsafe { &*(rip as *const AsmBody) };
    run(unsafe { &mut *spu }, body, 0, 0);
}

/// Run the body of the [InnerEntry] `rip` from that entry, which is at the thread's `pc`.
unsafe extern "C" fn exec_asm_inner(spu: *mut SpuThread, _ls: *mut u8, rip: *const u8) {
    let e = unsafe { &*(rip as *const InnerEntry<AsmBody>) };
    run(unsafe { &mut *spu }, unsafe { e.body() }, e.start, e.off);
}

/// Run `body` from op `start`, which is `off` bytes into the function.
fn run(spu: &mut SpuThread, body: &AsmBody, start: usize, off: u32) {
    let base = spu.pc.wrapping_sub(off) & LS_MASK;
    if !spu.ls.matches(base, &body.key) {
        fall_back(spu);
        return;
    }
    let mut i = start;
    loop {
        let Some(op) = body.ops.get(i) else {
            match body.end_exit {
                Some(e) => e.take(spu, body.entry, base),
                None => {
                    spu.pc = at(base, (i as u32) << 2);
                    spu.next = None;
                }
            }
            return;
        };
        let pos = at(base, (i as u32) << 2);
        let target = match *op {
            Op::Hole => {
                spu.pc = pos;
                spu.next = None;
                return;
            }
            Op::Nop => None,
            Op::Plain(w) => {
                let SpuThread {
                    handler, gpr, ls, ..
                } = &mut *spu;
                handler.execute(gpr, ls, pos, w);
                None
            }
            Op::Link { rt } => {
                spu.gpr[usize::from(rt)] = at(pos, 4);
                None
            }
            Op::Stop(code) => {
                spu.stop(code, pos);
                return;
            }
            Op::Jump(t) => Some(t),
            Op::Cond { cond, rt, target } => {
                if cond.taken(spu.gpr[usize::from(rt)]) {
                    Some(target)
                } else {
                    None
                }
            }
            Op::Call { rt, exit } => {
                spu.gpr[usize::from(rt)] = at(pos, 4);
                exit.take(spu, body.entry, base);
                return;
            }
            Op::Indirect { ra, link, cond } => {
                if let Some((c, rt)) = cond {
                    if !c.taken(spu.gpr[usize::from(rt)]) {
                        i += 1;
                        continue;
                    }
                }
                let target = spu.gpr[usize::from(ra)] & LS_MASK;
                if let Some(rt) = link {
                    spu.gpr[usize::from(rt)] = at(pos, 4);
                }
                spu.pc = target;
                spu.next = None;
                return;
            }
            Op::Iret => {
                spu.pc = spu.srr0 & LS_MASK;
                spu.next = None;
                return;
            }
        };
        match target {
            None => i += 1,
            Some(Target::Local(j)) => i = j,
            Some(Target::Exit(e)) => {
                e.take(spu, body.entry, base);
                return;
            }
        }
    }
}
