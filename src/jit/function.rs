//! Basic blocks and the per-trace instruction arena
//!
//! All instructions of one recording attempt live in a single vector and
//! are addressed by [`InstId`]. A [`BasicBlock`] holds ids into that arena
//! in execution order; an instruction records the block that owns it, or
//! `None` once it has been removed. Blocks form a forward singly linked
//! layout list starting at the entry block.

use super::ir::{BlockId, Inst, InstId, InstKind};
use crate::bytecode::Pc;
use std::fmt;

/// A straight-line run of instructions
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: BlockId,
    /// First program counter of the block; `None` for the entry block
    pub start: Option<Pc>,
    pub insts: Vec<InstId>,
    /// Next block in layout order
    pub next: Option<BlockId>,
    /// Inlined call depth when the block was opened
    pub depth: u32,
    /// Register-stack height when the block was opened
    pub height: i32,
}

impl BasicBlock {
    fn new(id: BlockId, start: Option<Pc>, depth: u32, height: i32) -> Self {
        Self {
            id,
            start,
            insts: Vec::with_capacity(8),
            next: None,
            depth,
            height,
        }
    }

    /// Last instruction of the block
    pub fn last(&self) -> Option<InstId> {
        self.insts.last().copied()
    }
}

/// The IR of one trace: an instruction arena plus its basic blocks
#[derive(Debug, Clone)]
pub struct Function {
    insts: Vec<Inst>,
    blocks: Vec<BasicBlock>,
    entry: Option<BlockId>,
    current: Option<BlockId>,
    last: Option<BlockId>,
    /// Stamped on every allocation
    source: Pc,
}

impl Function {
    pub fn new(capacity: usize) -> Self {
        Self {
            insts: Vec::with_capacity(capacity),
            blocks: Vec::new(),
            entry: None,
            current: None,
            last: None,
            source: Pc::default(),
        }
    }

    /// Drop every instruction and block, keeping the allocations
    pub fn clear(&mut self) {
        self.insts.clear();
        self.blocks.clear();
        self.entry = None;
        self.current = None;
        self.last = None;
        self.source = Pc::default();
    }

    /// Number of instruction ids handed out
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// Id the next allocation will receive
    pub fn next_id(&self) -> InstId {
        InstId(self.insts.len() as u32)
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.index()]
    }

    pub fn get(&self, id: InstId) -> Option<&Inst> {
        self.insts.get(id.index())
    }

    pub fn kind(&self, id: InstId) -> &InstKind {
        &self.insts[id.index()].kind
    }

    /// Whether `id` still belongs to a block
    pub fn is_live(&self, id: InstId) -> bool {
        self.get(id).map_or(false, |i| i.block.is_some())
    }

    /// Instructions still placed in blocks
    pub fn live_count(&self) -> usize {
        self.blocks.iter().map(|b| b.insts.len()).sum()
    }

    // ==================== Instructions ====================

    /// Attribute instructions allocated from now on to `pc`
    pub fn set_source(&mut self, pc: Pc) {
        self.source = pc;
    }

    /// Allocate an instruction without placing it in a block
    pub fn alloc(&mut self, kind: InstKind) -> InstId {
        let id = self.next_id();
        self.insts.push(Inst {
            id,
            kind,
            block: None,
            pc: self.source,
        });
        id
    }

    /// Place `id` at the end of the current block
    pub fn append(&mut self, id: InstId) {
        if let Some(block) = self.current {
            self.blocks[block.index()].insts.push(id);
            self.insts[id.index()].block = Some(block);
        }
    }

    /// Allocate and append
    pub fn push(&mut self, kind: InstKind) -> InstId {
        let id = self.alloc(kind);
        self.append(id);
        id
    }

    /// Place `id` in `block`, ahead of its terminator if it has one
    pub fn insert_before_terminator(&mut self, block: BlockId, id: InstId) {
        let at = {
            let b = &self.blocks[block.index()];
            match b.last() {
                Some(last) if self.insts[last.index()].kind.is_terminator() => b.insts.len() - 1,
                _ => b.insts.len(),
            }
        };
        self.blocks[block.index()].insts.insert(at, id);
        self.insts[id.index()].block = Some(block);
    }

    /// Swap an instruction's operation, keeping its id
    pub fn replace(&mut self, id: InstId, kind: InstKind) {
        self.insts[id.index()].kind = kind;
    }

    /// Take `id` out of its block
    pub fn remove(&mut self, id: InstId) {
        if let Some(block) = self.insts[id.index()].block.take() {
            self.blocks[block.index()].insts.retain(|&i| i != id);
        }
    }

    /// Undo everything allocated since `inst_mark` and every block opened
    /// since `block_mark`
    pub fn rollback(&mut self, inst_mark: InstId, block_mark: usize, current: Option<BlockId>) {
        for block in &mut self.blocks {
            block.insts.retain(|id| *id < inst_mark);
        }
        let len = self.insts.len();
        for inst in &mut self.insts[inst_mark.index().min(len)..] {
            inst.block = None;
        }
        if self.blocks.len() > block_mark {
            self.blocks.truncate(block_mark);
            self.last = block_mark.checked_sub(1).map(|i| BlockId(i as u32));
            if let Some(last) = self.last {
                self.blocks[last.index()].next = None;
            }
        }
        self.current = current;
    }

    // ==================== Blocks ====================

    pub fn entry(&self) -> Option<BlockId> {
        self.entry
    }

    pub fn current(&self) -> Option<BlockId> {
        self.current
    }

    pub fn set_current(&mut self, block: Option<BlockId>) {
        self.current = block;
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Open a block and append it to the layout list. The first block
    /// opened is the entry block.
    pub fn create_block(&mut self, start: Option<Pc>, depth: u32, height: i32) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::new(id, start, depth, height));
        match self.last {
            Some(last) => self.blocks[last.index()].next = Some(id),
            None => self.entry = Some(id),
        }
        self.last = Some(id);
        id
    }

    /// Block starting at `pc` opened with the same call depth and stack
    /// height
    pub fn find_block(&self, pc: Pc, depth: u32, height: i32) -> Option<BlockId> {
        self.layout()
            .map(|id| &self.blocks[id.index()])
            .find(|b| b.start == Some(pc) && b.depth == depth && b.height == height)
            .map(|b| b.id)
    }

    /// Whether the current block already ends in a jump or exit
    pub fn is_terminated(&self) -> bool {
        self.current
            .and_then(|b| self.blocks[b.index()].last())
            .map_or(false, |last| self.insts[last.index()].kind.is_terminator())
    }

    /// Block ids in layout order
    pub fn layout(&self) -> impl Iterator<Item = BlockId> + '_ {
        std::iter::successors(self.entry, move |b| self.blocks[b.index()].next)
    }

    /// Live instructions in layout order
    pub fn live_insts(&self) -> impl Iterator<Item = &Inst> + '_ {
        self.layout()
            .flat_map(move |b| self.blocks[b.index()].insts.iter())
            .map(move |id| &self.insts[id.index()])
    }

    /// Resolve every unlinked `Jump` to the block that starts at its
    /// target, preferring blocks that follow the jump in layout order
    pub fn link_blocks(&mut self) {
        let order: Vec<BlockId> = self.layout().collect();
        for (pos, &block) in order.iter().enumerate() {
            let Some(last) = self.blocks[block.index()].last() else {
                continue;
            };
            let InstKind::Jump { target, block: None } = self.insts[last.index()].kind else {
                continue;
            };
            let starts_at = |b: &BlockId| self.blocks[b.index()].start == Some(target);
            let resolved = order[pos + 1..]
                .iter()
                .find(|b| starts_at(b))
                .or_else(|| order[..=pos].iter().find(|b| starts_at(b)))
                .copied();
            if let Some(resolved) = resolved {
                self.insts[last.index()].kind = InstKind::Jump {
                    target,
                    block: Some(resolved),
                };
            }
        }
    }
}

impl Default for Function {
    fn default() -> Self {
        Self::new(crate::config::IR_ARENA_CAPACITY)
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for id in self.layout() {
            let block = &self.blocks[id.index()];
            match block.start {
                Some(pc) => writeln!(
                    f,
                    "{} ({}, depth={}, height={}):",
                    id, pc, block.depth, block.height
                )?,
                None => writeln!(f, "{} (entry):", id)?,
            }
            for inst in &block.insts {
                writeln!(f, "  {}", self.insts[inst.index()])?;
            }
        }
        Ok(())
    }
}
