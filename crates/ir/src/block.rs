use crate::{ail, vex};
use petgraph::{Graph, graph::NodeIndex};

/// The dialect a block was lifted into.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockIr {
    Vex(vex::Block),
    Ail(ail::Block),
}

/// A lifted basic block.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub addr: u64,
    pub ir: BlockIr,
}

impl Block {
    pub fn new(addr: u64, ir: BlockIr) -> Self {
        Self { addr, ir }
    }
}

pub type BlockId = NodeIndex;
pub type FlowGraph = Graph<Block, ()>;

/// A function: its entry address and the flow graph of its blocks.
#[derive(Debug, Clone)]
pub struct Function {
    addr: u64,
    entry: Option<BlockId>,
    graph: FlowGraph,
}

impl Function {
    pub fn new(addr: u64) -> Self {
        Self {
            addr,
            entry: None,
            graph: Graph::new(),
        }
    }

    /// Entry address of the function.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Adds a block. The first block added becomes the entry.
    pub fn add_block(&mut self, block: Block) -> BlockId {
        let id = self.graph.add_node(block);
        self.entry.get_or_insert(id);
        id
    }

    /// Adds a flow edge between two blocks.
    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        self.graph.add_edge(from, to, ());
    }

    /// The entry block.
    ///
    /// # Panics
    /// Panics if no block has been added.
    #[inline]
    pub fn entry(&self) -> BlockId {
        self.entry.expect("function has no blocks")
    }

    #[inline]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.graph[id]
    }

    #[inline]
    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    /// Number of blocks.
    #[inline]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }
}

#[cfg(test)]
mod test {
    use super::{Block, BlockIr, Function};
    use crate::vex;

    fn empty_block(addr: u64) -> Block {
        Block::new(
            addr,
            BlockIr::Vex(vex::Block::new(
                Vec::new(),
                vex::TyEnv::default(),
                vex::JumpKind::Boring,
            )),
        )
    }

    #[test]
    fn first_block_becomes_the_entry() {
        let mut func = Function::new(0x1000);
        let a = func.add_block(empty_block(0x1000));
        let b = func.add_block(empty_block(0x1010));
        func.add_edge(a, b);

        assert_eq!(func.entry(), a);
        assert_eq!(func.block(b).addr, 0x1010);
        assert_eq!(func.len(), 2);
    }
}
