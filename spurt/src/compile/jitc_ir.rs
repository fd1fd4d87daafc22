//! The optimising compiler.
//!
//! A function is lowered into basic blocks, each a run of straight-line instructions ending in
//! an explicit terminator. Block boundaries come from the analysis (every block start it found)
//! plus the word after every control transfer and both sides of every hole. Words with no effect
//! (`NOP`, `LNOP`, branch hints, branches to the next word) are dropped, so the executor only
//! ever sees instructions the handler must run, and intra-function branches become block indices.

use super::{
    at, fall_back, CompilationError, CompiledFunction, Compiler, Exit, Exits, InnerEntries,
    InnerEntry, Target,
};
use crate::{
    analysis::{Analyser, Function, FunctionKey},
    isa::{decode, is_absolute, is_hint, reg, Cond, Insn, LS_MASK},
    log::{log_ir, should_log_ir, IRPhase},
    runtime::{SpuFunction, SpuRuntime, ThunkHead},
    thread::SpuThread,
};
use smallvec::SmallVec;
use std::{
    any::Any,
    collections::HashMap,
    fmt::{self, Display},
    sync::Arc,
};
use vob::Vob;

/// The most basic blocks a single function may be lowered into.
const MAX_BLOCKS: usize = 0x2000;

pub(crate) struct IrCompiler;

impl Compiler for IrCompiler {
    fn name(&self) -> &'static str {
        "ir"
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
        let blocks = Lower::new(func, analysis, &mut exits)?.lower()?;
        let body = Box::new(IrBody {
            head: ThunkHead::new(exec_ir),
            entry: func.entry,
            key: Arc::clone(&func.words),
            blocks,
        });
        if should_log_ir(IRPhase::Ir) {
            log_ir(&format!("--- Begin ir ---\n{body}--- End ir ---\n"));
        }
        let code = rt.make_thunk(&body.head)?;
        let inner = InnerEntries::new(rt, analysis, &*body, exec_ir_inner, |off| {
            body.blocks.iter().position(|b| b.start == off)
        })?;
        Ok(Arc::new(IrFunction { body, code, inner }))
    }
}

/// A straight-line instruction. Offsets are in bytes from the function's entry.
#[derive(Copy, Clone, Debug, PartialEq)]
enum Inst {
    /// Run `w` with the thread's instruction handler.
    Plain { off: u32, w: u32 },
    /// `rt` = the address of the word after `off`.
    Link { off: u32, rt: u8 },
}

#[derive(Copy, Clone, Debug)]
enum Term {
    Goto(Target),
    Branch {
        cond: Cond,
        rt: u8,
        taken: Target,
        fallthrough: Target,
    },
    Call {
        off: u32,
        rt: u8,
        exit: Exit,
    },
    Indirect {
        off: u32,
        ra: u8,
        link: Option<u8>,
        /// For conditional forms, the condition and where control goes if it doesn't hold.
        cond: Option<(Cond, u8, Target)>,
    },
    Stop {
        off: u32,
        code: u32,
    },
    Iret,
    /// Control reached a word analysis never walked: leave through the dispatch table.
    Hole {
        off: u32,
    },
}

#[derive(Debug)]
struct IrBlock {
    /// The block's offset from the function's entry.
    start: u32,
    insts: Vec<Inst>,
    /// The registers the block writes, in order of first write.
    clobbers: SmallVec<[u8; 8]>,
    term: Term,
}

/// Lowers one analysed function into [IrBlock]s.
struct Lower<'a, 'b> {
    func: &'a Function,
    analysis: &'a Analyser,
    exits: &'a mut Exits<'b>,
    /// Word indices that start a block.
    leaders: Vob,
    /// Maps a leader's word index to its block index.
    block_of: HashMap<usize, usize>,
}

impl<'a, 'b> Lower<'a, 'b> {
    fn new(
        func: &'a Function,
        analysis: &'a Analyser,
        exits: &'a mut Exits<'b>,
    ) -> Result<Self, CompilationError> {
        let n = func.words.len();
        let mut leaders = Vob::from_elem(false, n + 1);
        leaders.set(0, true);
        for (i, &w) in func.words.iter().enumerate() {
            let pos = func.entry + ((i as u32) << 2);
            if analysis.is_block_start(pos) {
                leaders.set(i, true);
            }
            if w == 0 {
                leaders.set(i, true);
                leaders.set(i + 1, true);
            } else if analysis.targets(pos).is_some() {
                leaders.set(i + 1, true);
            }
        }
        let block_of = leaders
            .iter_set_bits(..n)
            .enumerate()
            .map(|(b, i)| (i, b))
            .collect::<HashMap<_, _>>();
        if block_of.len() > MAX_BLOCKS {
            return Err(CompilationError::LimitExceeded(format!(
                "{} blocks at {:#07x}",
                block_of.len(),
                func.entry
            )));
        }
        Ok(Self {
            func,
            analysis,
            exits,
            leaders,
            block_of,
        })
    }

    fn off(&self, i: usize) -> u32 {
        (i as u32) << 2
    }

    /// Where control goes when it reaches word index `i` by falling through.
    fn fallthrough(&mut self, i: usize) -> Result<Target, CompilationError> {
        match self.block_of.get(&i) {
            Some(b) => Ok(Target::Local(*b)),
            None => Ok(Target::Exit(
                self.exits.exit(at(self.func.entry, self.off(i)), true)?,
            )),
        }
    }

    /// Where a direct branch encoded by `w` to `target` goes.
    fn branch(&mut self, w: u32, target: u32) -> Result<Target, CompilationError> {
        let relative = !is_absolute(w);
        if relative && self.func.contains(target) {
            if let Some(b) = self.block_of.get(&(((target - self.func.entry) >> 2) as usize)) {
                return Ok(Target::Local(*b));
            }
        }
        Ok(Target::Exit(self.exits.exit(target, relative)?))
    }

    fn lower(mut self) -> Result<Vec<IrBlock>, CompilationError> {
        let n = self.func.words.len();
        let starts = self.leaders.iter_set_bits(..n).collect::<Vec<_>>();
        let mut blocks = Vec::with_capacity(starts.len());
        for start in starts {
            let mut insts = Vec::new();
            let mut clobbers: SmallVec<[u8; 8]> = SmallVec::new();
            let mut i = start;
            let term = loop {
                if i == n || (i != start && self.leaders.get(i).unwrap_or(false)) {
                    break Term::Goto(self.fallthrough(i)?);
                }
                let off = self.off(i);
                let w = self.func.words[i];
                let pos = self.func.entry + off;
                if w == 0 {
                    break Term::Hole { off };
                }
                let r = self.analysis.regmod(pos);
                if r != reg::NONE && usize::from(r) < 128 && !clobbers.contains(&r) {
                    clobbers.push(r);
                }
                match decode(pos, w) {
                    Insn::Null => break Term::Hole { off },
                    Insn::Nop => (),
                    Insn::Plain | Insn::Const { .. } => {
                        if !is_hint(w) {
                            insts.push(Inst::Plain { off, w });
                        }
                    }
                    Insn::Stop { code } => break Term::Stop { off, code },
                    Insn::StopD => break Term::Stop { off, code: 0 },
                    Insn::Iret => break Term::Iret,
                    Insn::Br { target } => {
                        if target != pos + 4 {
                            break Term::Goto(self.branch(w, target)?);
                        }
                    }
                    Insn::BrCond { cond, rt, target } => {
                        if target != pos + 4 {
                            break Term::Branch {
                                cond,
                                rt,
                                taken: self.branch(w, target)?,
                                fallthrough: self.fallthrough(i + 1)?,
                            };
                        }
                    }
                    Insn::BrSl { target, rt } => {
                        if target == pos + 4 {
                            insts.push(Inst::Link { off, rt });
                        } else {
                            break Term::Call {
                                off,
                                rt,
                                exit: self.exits.exit(target, !is_absolute(w))?,
                            };
                        }
                    }
                    Insn::Bi { ra } => {
                        break Term::Indirect {
                            off,
                            ra,
                            link: None,
                            cond: None,
                        }
                    }
                    Insn::BiSl { ra, rt } => {
                        break Term::Indirect {
                            off,
                            ra,
                            link: Some(rt),
                            cond: None,
                        }
                    }
                    Insn::BiCond { cond, rt, ra } => {
                        break Term::Indirect {
                            off,
                            ra,
                            link: None,
                            cond: Some((cond, rt, self.fallthrough(i + 1)?)),
                        }
                    }
                }
                i += 1;
            };
            blocks.push(IrBlock {
                start: self.off(start),
                insts,
                clobbers,
                term,
            });
        }
        Ok(blocks)
    }
}

#[derive(Debug)]
#[repr(C)]
struct IrBody {
    head: ThunkHead,
    entry: u32,
    key: FunctionKey,
    blocks: Vec<IrBlock>,
}

fn fmt_target(t: &Target) -> String {
    match t {
        Target::Local(b) => format!("bb{b}"),
        Target::Exit(e) => format!("exit {:#07x}", e.target()),
    }
}

impl Display for IrBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "func {:#07x} ({} words)", self.entry, self.key.len())?;
        for (bi, b) in self.blocks.iter().enumerate() {
            write!(f, "bb{bi} (+{:#x}):", b.start)?;
            if !b.clobbers.is_empty() {
                let cs = b.clobbers.iter().map(|r| format!("${r}")).collect::<Vec<_>>();
                write!(f, " clobbers {}", cs.join(", "))?;
            }
            writeln!(f)?;
            for inst in &b.insts {
                match inst {
                    Inst::Plain { off, w } => writeln!(f, "  +{off:#x}: {w:08x}")?,
                    Inst::Link { off, rt } => writeln!(f, "  +{off:#x}: ${rt} = link")?,
                }
            }
            match &b.term {
                Term::Goto(t) => writeln!(f, "  goto {}", fmt_target(t))?,
                Term::Branch {
                    cond,
                    rt,
                    taken,
                    fallthrough,
                } => writeln!(
                    f,
                    "  if {cond:?} ${rt} goto {} else {}",
                    fmt_target(taken),
                    fmt_target(fallthrough)
                )?,
                Term::Call { rt, exit, .. } => {
                    writeln!(f, "  call {:#07x} link ${rt}", exit.target())?
                }
                Term::Indirect { ra, link, cond, .. } => {
                    write!(f, "  indirect ${ra}")?;
                    if let Some(rt) = link {
                        write!(f, " link ${rt}")?;
                    }
                    if let Some((c, rt, fallthrough)) = cond {
                        write!(f, " if {c:?} ${rt} else {}", fmt_target(fallthrough))?;
                    }
                    writeln!(f)?
                }
                Term::Stop { code, .. } => writeln!(f, "  stop {code:#x}")?,
                Term::Iret => writeln!(f, "  iret")?,
                Term::Hole { off } => writeln!(f, "  hole +{off:#x}")?,
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct IrFunction {
    body: Box<IrBody>,
    code: SpuFunction,
    inner: InnerEntries<IrBody>,
}

impl CompiledFunction for IrFunction {
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

/// Run the [IrBody] `rip` at the thread's `pc`.
unsafe extern "C" fn exec_ir(spu: *mut SpuThread, _ls: *mut u8, rip: *const u8) {
    let body = unsafe { &*(rip as *const IrBody) };
    run(unsafe { &mut *spu }, body, 0, 0);
}

/// Run the body of the [InnerEntry] `rip` from that entry, which is at the thread's `pc`.
unsafe extern "C" fn exec_ir_inner(spu: *mut SpuThread, _ls: *mut u8, rip: *const u8) {
    let e = unsafe { &*(rip as *const InnerEntry<IrBody>) };
    run(unsafe { &mut *spu }, unsafe { e.body() }, e.start, e.off);
}

/// Run `body` from block `start`, which is `off` bytes into the function.
fn run(spu: &mut SpuThread, body: &IrBody, start: usize, off: u32) {
    let base = spu.pc.wrapping_sub(off) & LS_MASK;
    if !spu.ls.matches(base, &body.key) {
        fall_back(spu);
        return;
    }
    let mut cur = start;
    loop {
        let Some(b) = body.blocks.get(cur) else {
            // Lowering only produces in-range block indices.
            spu.pc = base;
            spu.next = None;
            return;
        };
        {
            let SpuThread {
                handler, gpr, ls, ..
            } = &mut *spu;
            for inst in &b.insts {
                match *inst {
                    Inst::Plain { off, w } => handler.execute(gpr, ls, at(base, off), w),
                    Inst::Link { off, rt } => gpr[usize::from(rt)] = at(base, off + 4),
                }
            }
        }
        let next = match b.term {
            Term::Goto(t) => t,
            Term::Branch {
                cond,
                rt,
                taken,
                fallthrough,
            } => {
                if cond.taken(spu.gpr[usize::from(rt)]) {
                    taken
                } else {
                    fallthrough
                }
            }
            Term::Call { off, rt, exit } => {
                spu.gpr[usize::from(rt)] = at(base, off + 4);
                exit.take(spu, body.entry, base);
                return;
            }
            Term::Indirect {
                off,
                ra,
                link,
                cond,
            } => {
                let skip = cond.and_then(|(c, rt, fallthrough)| {
                    (!c.taken(spu.gpr[usize::from(rt)])).then_some(fallthrough)
                });
                if let Some(fallthrough) = skip {
                    fallthrough
                } else {
                    let target = spu.gpr[usize::from(ra)] & LS_MASK;
                    if let Some(rt) = link {
                        spu.gpr[usize::from(rt)] = at(base, off + 4);
                    }
                    spu.pc = target;
                    spu.next = None;
                    return;
                }
            }
            Term::Stop { off, code } => {
                spu.stop(code, at(base, off));
                return;
            }
            Term::Iret => {
                spu.pc = spu.srr0 & LS_MASK;
                spu.next = None;
                return;
            }
            Term::Hole { off } => {
                spu.pc = at(base, off);
                spu.next = None;
                return;
            }
        };
        match next {
            Target::Local(b) => cur = b,
            Target::Exit(e) => {
                e.take(spu, body.entry, base);
                return;
            }
        }
    }
}
