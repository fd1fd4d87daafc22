//! Static analysis of guest code: given an entry address, discover the function that starts
//! there.
//!
//! The analysis walks forward from the entry over a worklist of block starts, recording
//! control-flow edges, which register each word writes, and which positions other code can enter
//! the function at. A post-pass then trims the function to the code that is contiguous and
//! reachable from the entry. All tables are dense per-position arrays (one entry per instruction
//! position in the local storage) so that lookups are trivial; they are reset on every analysis.
//!
//! The walk also ends where it runs into the entry of a function discovered earlier: that code
//! belongs to the other function, and reaching it leaves this one.
//!
//! Words inside the function's range that the walk never reaches are "holes". A hole is only
//! tolerated if the local storage contains a `NOP`/`LNOP` there (i.e. alignment padding); holes
//! are stored as `0` in the function's key.

use crate::{
    compile::CompilationError,
    isa::{decode, reg, regmod, Insn, LNOP, LS_MASK, LS_SIZE, LS_WORDS, NOP},
    storage::GuestStorage,
};
use smallvec::{smallvec, SmallVec};
use std::{
    cmp::min,
    collections::HashMap,
    fmt::{self, Write},
    mem,
    sync::Arc,
};
use vob::Vob;

/// The content of a function: its words from the entry onwards, with holes as `0`. Two functions
/// with the same content are the same function, wherever they live in the local storage.
pub type FunctionKey = Arc<[u32]>;

/// The default upper bound on a function's length in words.
pub const DEFAULT_MAX_FUNCTION_WORDS: usize = 0x4000;

/// A function discovered by [Analyser::block].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    pub entry: u32,
    pub words: FunctionKey,
}

impl Function {
    /// The address one past the last word of the function.
    pub fn end(&self) -> u32 {
        self.entry + ((self.words.len() as u32) << 2)
    }

    /// Is `pos` inside this function?
    pub fn contains(&self, pos: u32) -> bool {
        pos >= self.entry && pos < self.end()
    }

    /// The word at `pos`, which must be inside the function.
    pub fn word(&self, pos: u32) -> u32 {
        self.words[((pos - self.entry) >> 2) as usize]
    }
}

/// A maximal straight-line run of words found by one walk of the analysis.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub start: u32,
    /// Length in words.
    pub len: u32,
}

impl Block {
    pub fn end(&self) -> u32 {
        self.start + (self.len << 2)
    }
}

#[inline]
fn idx(pos: u32) -> usize {
    (pos >> 2) as usize
}

#[inline]
fn bit(v: &Vob, i: usize) -> bool {
    v.get(i).unwrap_or(false)
}

fn clear_from(v: &mut Vob, from: usize) {
    for i in v.iter_set_bits(from..).collect::<Vec<_>>() {
        v.set(i, false);
    }
}

pub struct Analyser {
    max_words: usize,
    entry: u32,
    /// One past the last position that can belong to the function.
    limit: u32,
    /// A snapshot of every word the walks looked at.
    words: Box<[u32]>,
    /// Positions a walk has covered.
    walked: Vob,
    /// Block starts: the entry and every discovered intra-function branch target.
    block_info: Vob,
    /// Positions at which the function can be entered.
    entry_info: Vob,
    /// The register written by each word, or [reg::NONE].
    regmod: Box<[u8]>,
    /// For each control-transfer word, its possible successors. Words absent from this map fall
    /// through; an empty list means "leaves the function by means not known statically".
    targets: HashMap<u32, SmallVec<[u32; 2]>>,
    /// For each block start, the words that can transfer control to it.
    preds: HashMap<u32, SmallVec<[u32; 2]>>,
    /// For each word in the function, the word index of the entry point that owns it.
    entry_map: Box<[u16]>,
    blocks: Vec<Block>,
    workload: Vec<u32>,
}

impl Analyser {
    pub fn new(max_words: usize) -> Self {
        Self {
            max_words: max_words.clamp(1, LS_WORDS),
            entry: 0,
            limit: 0,
            words: vec![0; LS_WORDS].into_boxed_slice(),
            walked: Vob::from_elem(false, LS_WORDS),
            block_info: Vob::from_elem(false, LS_WORDS),
            entry_info: Vob::from_elem(false, LS_WORDS),
            regmod: vec![reg::NONE; LS_WORDS].into_boxed_slice(),
            targets: HashMap::new(),
            preds: HashMap::new(),
            entry_map: vec![0; LS_WORDS].into_boxed_slice(),
            blocks: Vec::new(),
            workload: Vec::new(),
        }
    }

    pub fn max_words(&self) -> usize {
        self.max_words
    }

    fn reset(&mut self) {
        self.walked.set_all(false);
        self.block_info.set_all(false);
        self.entry_info.set_all(false);
        self.regmod.fill(reg::NONE);
        self.words.fill(0);
        self.entry_map.fill(0);
        self.targets.clear();
        self.preds.clear();
        self.blocks.clear();
        self.workload.clear();
    }

    /// Discover the function starting at `entry` in `ls`. The analysis tables describe that
    /// function until the next call.
    pub fn block<S: GuestStorage + ?Sized>(
        &mut self,
        ls: &S,
        entry: u32,
    ) -> Result<Function, CompilationError> {
        self.block_with(ls, entry, &|_| false)
    }

    /// As [Self::block], but `known(pos)` says whether another function has already been
    /// discovered at `pos`. Such a position, other than `entry`, is never part of this function:
    /// the function is cut short there and falls through into the other one.
    pub fn block_with<S: GuestStorage + ?Sized>(
        &mut self,
        ls: &S,
        entry: u32,
        known: &dyn Fn(u32) -> bool,
    ) -> Result<Function, CompilationError> {
        self.reset();
        let entry = entry & LS_MASK;
        self.entry = entry;
        self.limit = min(LS_SIZE, entry + ((self.max_words as u32) << 2));
        self.block_info.set(idx(entry), true);
        self.entry_info.set(idx(entry), true);
        self.workload.push(entry);

        let mut i = 0;
        while i < self.workload.len() {
            let start = self.workload[i];
            i += 1;
            if start < self.limit {
                self.walk(ls, start, known);
            }
        }

        self.trim(ls);
        if self.limit == self.entry {
            return Err(CompilationError::EmptyFunction(entry));
        }
        self.map_entries();

        let words = (entry..self.limit)
            .step_by(4)
            .map(|pos| {
                if bit(&self.walked, idx(pos)) {
                    self.words[idx(pos)]
                } else {
                    0
                }
            })
            .collect::<Vec<_>>();
        Ok(Function {
            entry,
            words: Arc::from(words),
        })
    }

    /// Walk forward from the block start `start` until the end of the block.
    fn walk<S: GuestStorage + ?Sized>(
        &mut self,
        ls: &S,
        start: u32,
        known: &dyn Fn(u32) -> bool,
    ) {
        // Weakly propagated preferred-slot constants, used to resolve indirect branches.
        let mut consts: [Option<u32>; 128] = [None; 128];
        let mut pos = start;
        let mut prev = None;
        loop {
            if pos >= self.limit {
                break;
            }
            if pos != self.entry && known(pos) {
                // Another function starts here.
                self.limit = pos;
                break;
            }
            let i = idx(pos);
            if bit(&self.walked, i) || (pos != start && bit(&self.block_info, i)) {
                // We've fallen through into code that is, or will be, walked from elsewhere.
                if prev.is_some() {
                    self.add_block(pos);
                }
                break;
            }
            let w = ls.word(pos);
            let insn = decode(pos, w);
            if insn == Insn::Null {
                break;
            }
            self.walked.set(i, true);
            self.words[i] = w;
            prev = Some(pos);
            let next = pos + 4;
            match insn {
                Insn::Null => unreachable!(),
                Insn::Stop { .. } | Insn::StopD | Insn::Iret => {
                    self.targets.insert(pos, SmallVec::new());
                    break;
                }
                Insn::Nop | Insn::Plain => {
                    let r = regmod(w);
                    self.regmod[i] = r;
                    if let Some(c) = consts.get_mut(usize::from(r)) {
                        *c = None;
                    }
                }
                Insn::Const { rt, keep, value } => {
                    self.regmod[i] = rt;
                    let c = &mut consts[usize::from(rt)];
                    *c = if keep == 0 {
                        Some(value)
                    } else {
                        c.map(|x| (x & keep) | value)
                    };
                }
                Insn::Br { target } => {
                    if target != next {
                        self.targets.insert(pos, smallvec![target]);
                        self.add_block(target);
                        break;
                    }
                }
                Insn::BrCond { target, .. } => {
                    if target != next {
                        self.targets.insert(pos, smallvec![target, next]);
                        self.add_block(target);
                        self.add_block(next);
                        break;
                    }
                }
                Insn::BrSl { target, rt } => {
                    self.regmod[i] = rt;
                    consts[usize::from(rt)] = Some(next);
                    // `BRSL rt, +4` is the "get next address" idiom, not a call.
                    if target != next {
                        self.targets.insert(pos, smallvec![target, next]);
                        self.call(target, next);
                        break;
                    }
                }
                Insn::Bi { ra } => {
                    match consts[usize::from(ra)] {
                        Some(c) => {
                            let target = c & LS_MASK;
                            self.targets.insert(pos, smallvec![target]);
                            self.add_block(target);
                        }
                        None => {
                            self.targets.insert(pos, SmallVec::new());
                        }
                    }
                    break;
                }
                Insn::BiSl { ra, rt } => {
                    self.regmod[i] = rt;
                    let target = consts[usize::from(ra)].map(|c| c & LS_MASK);
                    consts[usize::from(rt)] = Some(next);
                    let mut ts: SmallVec<[u32; 2]> = SmallVec::new();
                    ts.extend(target);
                    ts.push(next);
                    self.targets.insert(pos, ts);
                    match target {
                        Some(target) => self.call(target, next),
                        None => self.add_entry(next),
                    }
                    break;
                }
                Insn::BiCond { ra, .. } => {
                    let target = consts[usize::from(ra)].map(|c| c & LS_MASK);
                    let mut ts: SmallVec<[u32; 2]> = SmallVec::new();
                    ts.extend(target);
                    ts.push(next);
                    self.targets.insert(pos, ts);
                    if let Some(target) = target {
                        self.add_block(target);
                    }
                    self.add_block(next);
                    break;
                }
            }
            pos = next;
        }
        if let Some(p) = prev {
            self.blocks.push(Block {
                start,
                len: ((p - start) >> 2) + 1,
            });
        }
    }

    /// Record a call to `target` returning to `ret`. Code after the entry which is called belongs
    /// to another function.
    fn call(&mut self, target: u32, ret: u32) {
        if target > self.entry && target < self.limit {
            self.limit = target;
        }
        self.add_entry(ret);
    }

    /// Mark `target` as a block start, queueing it to be walked if it is new. Targets outside the
    /// function are exits and are ignored.
    fn add_block(&mut self, target: u32) {
        if target < self.entry || target >= self.limit {
            return;
        }
        let i = idx(target);
        if !bit(&self.block_info, i) {
            self.block_info.set(i, true);
            self.workload.push(target);
        }
    }

    fn add_entry(&mut self, target: u32) {
        if target >= self.entry && target < self.limit {
            self.entry_info.set(idx(target), true);
        }
        self.add_block(target);
    }

    /// The intra-function successors of the walked word at `pos`. Call targets are not
    /// successors: only the return point is.
    fn successors(&self, pos: u32) -> SmallVec<[u32; 2]> {
        match self.targets.get(&pos) {
            Some(ts) => match decode(pos, self.words[idx(pos)]) {
                Insn::BrSl { .. } | Insn::BiSl { .. } => smallvec![pos + 4],
                _ => ts.clone(),
            },
            None => smallvec![pos + 4],
        }
    }

    /// Shrink the function until it is contiguous and reachable from the entry.
    fn trim<S: GuestStorage + ?Sized>(&mut self, ls: &S) {
        let entry = self.entry;
        loop {
            let before = self.limit;
            // Nothing past the last walked word belongs to the function.
            self.limit = self
                .walked
                .iter_set_bits(idx(entry)..idx(self.limit))
                .last()
                .map(|i| ((i as u32) << 2) + 4)
                .unwrap_or(entry);

            // Holes must be padding.
            if let Some(pos) = (entry..self.limit).step_by(4).find(|pos| {
                !bit(&self.walked, idx(*pos)) && !matches!(ls.word(*pos), NOP | LNOP)
            }) {
                self.limit = pos;
            }

            // Every block must be reachable from the entry.
            let reached = self.reachable();
            if let Some(i) = self
                .block_info
                .iter_set_bits(idx(entry)..idx(self.limit))
                .find(|i| !bit(&reached, *i - idx(entry)))
            {
                self.limit = (i as u32) << 2;
            }

            if self.limit == before {
                break;
            }
        }
        self.prune();
    }

    /// Which words in `[entry, limit)` can be reached from the entry? Indexed relative to the
    /// entry.
    fn reachable(&self) -> Vob {
        let base = idx(self.entry);
        let mut seen = Vob::from_elem(false, idx(self.limit) - base);
        let mut todo = vec![self.entry];
        while let Some(pos) = todo.pop() {
            if pos < self.entry || pos >= self.limit {
                continue;
            }
            let i = idx(pos);
            if bit(&seen, i - base) || !bit(&self.walked, i) {
                continue;
            }
            seen.set(i - base, true);
            todo.extend(self.successors(pos));
        }
        seen
    }

    /// Remove everything at or beyond the final limit from the tables, and derive the
    /// predecessors of each block start from the surviving edges.
    fn prune(&mut self) {
        let limit = self.limit;
        let li = idx(limit);
        clear_from(&mut self.walked, li);
        clear_from(&mut self.block_info, li);
        clear_from(&mut self.entry_info, li);
        self.regmod[li..].fill(reg::NONE);
        self.targets.retain(|pos, _| *pos < limit);

        self.preds.clear();
        let walked = self
            .walked
            .iter_set_bits(idx(self.entry)..li)
            .collect::<Vec<_>>();
        for i in walked {
            let pos = (i as u32) << 2;
            for s in self.successors(pos) {
                if s >= self.entry && s < limit && bit(&self.block_info, idx(s)) {
                    let ps = self.preds.entry(s).or_default();
                    if !ps.contains(&pos) {
                        ps.push(pos);
                    }
                }
            }
        }
        self.blocks.retain_mut(|b| {
            if b.start >= limit {
                return false;
            }
            b.len = min(b.len, (limit - b.start) >> 2);
            true
        });
        self.blocks.sort_by_key(|b| b.start);

        // A branch into a run that had already been walked makes a block start inside it.
        let mut split = Vec::with_capacity(self.blocks.len());
        for b in mem::take(&mut self.blocks) {
            let mut start = b.start;
            for i in self.block_info.iter_set_bits(idx(b.start) + 1..idx(b.end())) {
                let pos = (i as u32) << 2;
                split.push(Block {
                    start,
                    len: (pos - start) >> 2,
                });
                start = pos;
            }
            split.push(Block {
                start,
                len: (b.end() - start) >> 2,
            });
        }
        self.blocks = split;
    }

    /// Compute the owner of every word. Owners propagate from each entry point along successors;
    /// a word reachable from two different entry points becomes an entry point itself, and the
    /// propagation is repeated until nothing changes.
    fn map_entries(&mut self) {
        let base = idx(self.entry);
        let n = idx(self.limit) - base;
        loop {
            let mut owner = vec![None; n];
            let entries = self
                .entry_info
                .iter_set_bits(base..base + n)
                .collect::<Vec<_>>();
            for &e in &entries {
                owner[e - base] = Some(e);
            }
            let mut conflicts = Vec::new();
            for &e in &entries {
                let mut todo = vec![(e as u32) << 2];
                while let Some(pos) = todo.pop() {
                    for s in self.successors(pos) {
                        if s < self.entry || s >= self.limit {
                            continue;
                        }
                        let si = idx(s);
                        if !bit(&self.walked, si) || bit(&self.entry_info, si) {
                            continue;
                        }
                        match owner[si - base] {
                            None => {
                                owner[si - base] = Some(e);
                                todo.push(s);
                            }
                            Some(o) if o == e => (),
                            Some(_) => conflicts.push(si),
                        }
                    }
                }
            }
            if conflicts.is_empty() {
                let mut last = base;
                for (k, o) in owner.into_iter().enumerate() {
                    // Holes belong to whoever owns the preceding word.
                    let o = o.unwrap_or(last);
                    self.entry_map[base + k] = o as u16;
                    last = o;
                }
                break;
            }
            for c in conflicts {
                self.entry_info.set(c, true);
            }
        }
    }

    /// The entry address of the last analysed function.
    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// One past the last address of the last analysed function.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// The straight-line runs of the last analysed function, sorted by start address.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn is_block_start(&self, pos: u32) -> bool {
        bit(&self.block_info, idx(pos))
    }

    pub fn is_entry(&self, pos: u32) -> bool {
        bit(&self.entry_info, idx(pos))
    }

    /// The entry points of the last analysed function in ascending order.
    pub fn entries(&self) -> impl Iterator<Item = u32> + '_ {
        self.entry_info
            .iter_set_bits(idx(self.entry)..idx(self.limit))
            .map(|i| (i as u32) << 2)
    }

    /// The successors of the control-transfer word at `pos`, or `None` if `pos` falls through.
    pub fn targets(&self, pos: u32) -> Option<&[u32]> {
        self.targets.get(&pos).map(|x| x.as_slice())
    }

    /// The words which can transfer control to the block start `pos`.
    pub fn preds(&self, pos: u32) -> &[u32] {
        self.preds.get(&pos).map(|x| x.as_slice()).unwrap_or(&[])
    }

    /// The register written by the word at `pos`, or [reg::NONE].
    pub fn regmod(&self, pos: u32) -> u8 {
        self.regmod[idx(pos)]
    }

    /// The entry point which owns the word at `pos`.
    pub fn owner(&self, pos: u32) -> u32 {
        u32::from(self.entry_map[idx(pos)]) << 2
    }

    /// Was the word at `pos` walked (i.e. is it code rather than a hole)?
    pub fn is_code(&self, pos: u32) -> bool {
        bit(&self.walked, idx(pos))
    }

    /// Render the analysis tables of the last analysed function.
    pub fn dump(&self, out: &mut String) {
        self.dump_inner(out).ok();
    }

    fn dump_inner(&self, out: &mut String) -> fmt::Result {
        writeln!(
            out,
            "function {:#07x}..{:#07x} ({} words)",
            self.entry,
            self.limit,
            (self.limit - self.entry) >> 2
        )?;
        let entries = self
            .entries()
            .map(|e| format!("{e:#07x}"))
            .collect::<Vec<_>>();
        writeln!(out, "  entries: {}", entries.join(", "))?;
        for b in &self.blocks {
            writeln!(
                out,
                "  block {:#07x} ({} words, owner {:#07x})",
                b.start,
                b.len,
                self.owner(b.start)
            )?;
            let mut preds = self.preds(b.start).to_vec();
            preds.sort_unstable();
            if !preds.is_empty() {
                let preds = preds
                    .iter()
                    .map(|p| format!("{p:#07x}"))
                    .collect::<Vec<_>>();
                writeln!(out, "    preds: {}", preds.join(", "))?;
            }
            for pos in (b.start..b.end()).step_by(4) {
                write!(out, "    {pos:05x}: {:08x}", self.words[idx(pos)])?;
                if self.is_block_start(pos) {
                    write!(out, " *")?;
                }
                let r = self.regmod(pos);
                if r != reg::NONE {
                    write!(out, " mod=${r}")?;
                }
                if let Some(ts) = self.targets(pos) {
                    let ts = ts.iter().map(|t| format!("{t:#07x}")).collect::<Vec<_>>();
                    write!(out, " -> [{}]", ts.join(", "))?;
                }
                writeln!(out)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::enc;

    const BR0: u32 = 0x3200_0000;

    #[test]
    fn self_loop() {
        let ls = vec![NOP, BR0];
        let mut a = Analyser::new(DEFAULT_MAX_FUNCTION_WORDS);
        let f = a.block(&ls, 0).unwrap();
        assert_eq!(f.entry, 0);
        assert_eq!(&f.words[..], &[NOP, BR0]);
        // The branch lands inside the run walked from the entry, splitting it.
        assert_eq!(
            a.blocks(),
            &[Block { start: 0, len: 1 }, Block { start: 4, len: 1 }]
        );
        assert!(a.is_entry(0));
        assert_eq!(a.entries().collect::<Vec<_>>(), vec![0]);
        assert_eq!(a.targets(4), Some(&[4][..]));
        assert_eq!(a.preds(4), &[0, 4]);
    }

    #[test]
    fn stops_at_null_data() {
        let ls = vec![NOP, enc::ai(3, 3, 1), 0, NOP];
        let mut a = Analyser::new(DEFAULT_MAX_FUNCTION_WORDS);
        let f = a.block(&ls, 0).unwrap();
        assert_eq!(&f.words[..], &[NOP, enc::ai(3, 3, 1)]);
        assert_eq!(a.regmod(4), 3);
        assert_eq!(a.regmod(0), reg::NONE);
    }

    #[test]
    fn empty_function() {
        let ls = vec![0u32; 4];
        let mut a = Analyser::new(DEFAULT_MAX_FUNCTION_WORDS);
        assert!(matches!(
            a.block(&ls, 8),
            Err(CompilationError::EmptyFunction(8))
        ));
    }

    #[test]
    fn conditional_branches_and_padding() {
        // 0x00: brz $3, 0x10
        // 0x04: ai $3, $3, 1
        // 0x08: br 0x14
        // 0x0c: lnop            (padding: a hole)
        // 0x10: ai $4, $4, 1
        // 0x14: stop
        let ls = vec![
            enc::brz(0, 0x10, 3),
            enc::ai(3, 3, 1),
            enc::br(8, 0x14),
            LNOP,
            enc::ai(4, 4, 1),
            enc::stop(1),
            NOP,
        ];
        let mut a = Analyser::new(DEFAULT_MAX_FUNCTION_WORDS);
        let f = a.block(&ls, 0).unwrap();
        assert_eq!(f.words.len(), 6);
        assert_eq!(f.words[3], 0);
        assert!(!a.is_code(0xc));
        assert_eq!(a.targets(0), Some(&[0x10, 0x4][..]));
        assert_eq!(a.targets(0x14), Some(&[][..]));
        assert!(a.is_block_start(0x10));
        assert!(a.is_block_start(0x14));
        assert_eq!(a.preds(0x14), &[0x8, 0x10]);
        assert_eq!(a.entries().collect::<Vec<_>>(), vec![0]);
        assert!((0..0x18).step_by(4).all(|p| a.owner(p) == 0));
    }

    #[test]
    fn non_padding_hole_truncates() {
        // 0x00: br 0x08
        // 0x04: ai $3, $3, 1   (never reached, not padding)
        // 0x08: stop
        let ls = vec![enc::br(0, 8), enc::ai(3, 3, 1), enc::stop(1)];
        let mut a = Analyser::new(DEFAULT_MAX_FUNCTION_WORDS);
        let f = a.block(&ls, 0).unwrap();
        assert_eq!(&f.words[..], &[enc::br(0, 8)]);
        assert_eq!(a.blocks(), &[Block { start: 0, len: 1 }]);
        assert!(!a.is_block_start(8));
    }

    #[test]
    fn calls_create_entry_points() {
        // 0x100: brsl $lr, 0x200
        // 0x104: ai $3, $3, 1
        // 0x108: bi $lr
        let mut ls = vec![0u32; 0x90];
        ls[0x40] = enc::brsl(0x100, 0x200, reg::LR);
        ls[0x41] = enc::ai(3, 3, 1);
        ls[0x42] = enc::bi(reg::LR);
        ls[0x80] = enc::stop(1);
        let mut a = Analyser::new(DEFAULT_MAX_FUNCTION_WORDS);
        let f = a.block(&ls[..], 0x100).unwrap();
        assert_eq!(f.words.len(), 3);
        assert_eq!(a.entries().collect::<Vec<_>>(), vec![0x100, 0x104]);
        assert_eq!(a.regmod(0x100), reg::LR);
        assert_eq!(a.targets(0x100), Some(&[0x200, 0x104][..]));
        // The link register is unknown at the start of the walk from 0x104.
        assert_eq!(a.targets(0x108), Some(&[][..]));
        assert_eq!(a.owner(0x104), 0x104);
        assert_eq!(a.owner(0x108), 0x104);
    }

    #[test]
    fn branch_into_a_walked_run() {
        // 0x00: ai $3, $3, 1
        // 0x04: ai $4, $4, -1
        // 0x08: ai $5, $5, 1
        // 0x0c: brnz $4, 0x04
        // 0x10: stop
        let ls = vec![
            enc::ai(3, 3, 1),
            enc::ai(4, 4, -1),
            enc::ai(5, 5, 1),
            enc::brnz(0xc, 4, 4),
            enc::stop(1),
        ];
        let mut a = Analyser::new(DEFAULT_MAX_FUNCTION_WORDS);
        a.block(&ls, 0).unwrap();
        assert_eq!(
            a.blocks(),
            &[
                Block { start: 0, len: 1 },
                Block { start: 4, len: 3 },
                Block { start: 0x10, len: 1 }
            ]
        );
        for b in a.blocks() {
            assert!(a.is_block_start(b.start));
            assert!((b.start + 4..b.end())
                .step_by(4)
                .all(|p| !a.is_block_start(p)));
        }
        let mut d = String::new();
        a.dump(&mut d);
        assert!(d.contains(
            "  block 0x00004 (3 words, owner 0x00000)\n    preds: 0x00000, 0x0000c\n"
        ));
    }

    #[test]
    fn known_functions_end_the_walk() {
        // 0x1f8: ai $3, $3, 1
        // 0x1fc: ai $3, $3, 1
        // 0x200: ai $3, $3, 1    (a function found earlier)
        // 0x204: stop
        let mut ls = vec![0u32; 0x82];
        ls[0x7e..].copy_from_slice(&[
            enc::ai(3, 3, 1),
            enc::ai(3, 3, 1),
            enc::ai(3, 3, 1),
            enc::stop(1),
        ]);
        let known = |pos: u32| pos == 0x200;
        let mut a = Analyser::new(DEFAULT_MAX_FUNCTION_WORDS);
        let f = a.block_with(&ls[..], 0x1f8, &known).unwrap();
        assert_eq!(f.words.len(), 2);
        assert_eq!(a.limit(), 0x200);
        assert_eq!(a.targets(0x1fc), None);
        // Branches to the other function leave this one too.
        ls[0x7f] = enc::br(0x1fc, 0x204);
        let f = a.block_with(&ls[..], 0x1f8, &|pos| pos == 0x204).unwrap();
        assert_eq!(f.words.len(), 2);
        assert_eq!(a.targets(0x1fc), Some(&[0x204][..]));
        ls[0x7f] = enc::ai(3, 3, 1);
        // A function's own entry is never foreign to it.
        let f = a.block_with(&ls[..], 0x200, &known).unwrap();
        assert_eq!(f.words.len(), 2);
        // Without the earlier function, the walk carries on into its code.
        let f = a.block(&ls[..], 0x1f8).unwrap();
        assert_eq!(f.words.len(), 4);
    }

    #[test]
    fn known_indirect_targets() {
        // 0x00: ila $5, 0x0c
        // 0x04: bi $5
        // 0x08: nop             (padding)
        // 0x0c: stop
        let ls = vec![enc::ila(5, 0xc), enc::bi(5), NOP, enc::stop(1)];
        let mut a = Analyser::new(DEFAULT_MAX_FUNCTION_WORDS);
        let f = a.block(&ls, 0).unwrap();
        assert_eq!(f.words.len(), 4);
        assert_eq!(a.targets(4), Some(&[0xc][..]));
        assert!(a.is_block_start(0xc));
    }

    #[test]
    fn bounded_length() {
        let ls = vec![NOP; 64];
        let mut a = Analyser::new(16);
        let f = a.block(&ls, 0).unwrap();
        assert_eq!(f.words.len(), 16);
        assert_eq!(a.targets(0x3c), None);
    }

    #[test]
    fn deterministic() {
        let ls = vec![
            enc::brz(0, 0x10, 3),
            enc::ai(3, 3, 1),
            enc::brsl(8, 0x40, reg::LR),
            enc::br(0xc, 0),
            enc::ai(4, 4, 1),
            enc::stop(1),
        ];
        let mut a = Analyser::new(DEFAULT_MAX_FUNCTION_WORDS);
        let f1 = a.block(&ls, 0).unwrap();
        let mut d1 = String::new();
        a.dump(&mut d1);
        a.block(&ls, 4).unwrap();
        let f2 = a.block(&ls, 0).unwrap();
        let mut d2 = String::new();
        a.dump(&mut d2);
        assert_eq!(f1, f2);
        assert_eq!(d1, d2);
        assert!(d1.starts_with("function 0x00000..0x00018 (6 words)"));
    }
}
