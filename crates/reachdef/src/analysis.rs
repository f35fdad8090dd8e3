use crate::{
    engine::{AilEngine, VexEngine},
    handler::FunctionHandler,
    loader::Loader,
    state::ReachingDefinitions,
};
use arch::{Arch, CallingConvention};
use easyerr::Error;
use ir::{Block, BlockId, BlockIr, Function};
use petgraph::{Direction, visit::DfsPostOrder};
use rustc_hash::{FxHashMap, FxHashSet};
use std::{collections::BTreeSet, sync::Arc};
use tracing::warn;

/// When a snapshot is taken, relative to the observed instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObserveAt {
    Before,
    After,
}

/// An instruction address paired with the side to observe on.
pub type ObservationPoint = (u64, ObserveAt);

/// Collects state snapshots at the configured observation points.
pub(crate) struct Observations {
    points: FxHashSet<ObservationPoint>,
    results: FxHashMap<ObservationPoint, ReachingDefinitions>,
}

impl Observations {
    fn new(points: FxHashSet<ObservationPoint>) -> Self {
        Self {
            points,
            results: FxHashMap::default(),
        }
    }

    pub(crate) fn record(&mut self, ins_addr: u64, at: ObserveAt, state: &ReachingDefinitions) {
        let key = (ins_addr, at);
        if self.points.contains(&key) {
            self.results.insert(key, state.copy());
        }
    }
}

/// Configuration of a run.
#[derive(Debug, Clone)]
pub struct Settings {
    /// How often a single block may be revisited before its state is frozen.
    pub max_iterations: u32,
    /// Whether uses of temporaries are recorded.
    pub track_tmps: bool,
    pub observation_points: FxHashSet<ObservationPoint>,
    /// Whether the entry state is seeded with the stack pointer and the
    /// calling-convention arguments.
    pub init_func: bool,
    pub cc: Option<CallingConvention>,
    pub current_depth: u32,
    pub maximum_depth: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            track_tmps: false,
            observation_points: FxHashSet::default(),
            init_func: false,
            cc: None,
            current_depth: 0,
            maximum_depth: 1,
        }
    }
}

/// What to analyse.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    /// A whole function, to its fixpoint.
    Function(&'a Function),
    /// A single block, in one pass.
    Block(&'a Block),
}

#[derive(Debug, Clone, Copy, Error)]
pub enum ResultError {
    #[error("no result is available")]
    Empty,
    #[error("more than one result is available")]
    Ambiguous,
}

/// A finished reaching definitions analysis.
///
/// Results are the state snapshots recorded at the observation points given
/// in [`Settings`]; a run without observation points computes the fixpoint
/// and then has nothing to report.
pub struct ReachingDefinitionsAnalysis {
    settings: Settings,
    observed_results: FxHashMap<ObservationPoint, ReachingDefinitions>,
    node_iterations: FxHashMap<u64, u32>,
}

impl ReachingDefinitionsAnalysis {
    /// Runs the analysis over `target` to completion.
    pub fn run<'h>(
        target: Target<'_>,
        arch: Arc<Arch>,
        loader: &dyn Loader,
        function_handler: Option<&mut (dyn FunctionHandler + 'h)>,
        init_state: Option<&ReachingDefinitions>,
        settings: Settings,
    ) -> Self {
        if settings.observation_points.is_empty() {
            warn!("no observation points are configured, the analysis will produce no results");
        }

        let mut observations = Observations::new(settings.observation_points.clone());
        let mut node_iterations: FxHashMap<u64, u32> = FxHashMap::default();

        match target {
            Target::Block(block) => {
                // initialization parameters only apply to functions
                let state = Self::initial_state(&arch, loader, init_state, &settings, None);
                Self::process_block(
                    block,
                    state,
                    &arch,
                    loader,
                    function_handler,
                    &mut observations,
                    &settings,
                );
                *node_iterations.entry(block.addr).or_default() += 1;
            }
            Target::Function(func) => Self::run_on_function(
                func,
                &arch,
                loader,
                function_handler,
                init_state,
                &settings,
                &mut observations,
                &mut node_iterations,
            ),
        }

        Self {
            settings,
            observed_results: observations.results,
            node_iterations,
        }
    }

    #[expect(clippy::too_many_arguments)]
    fn run_on_function<'a, 'h>(
        func: &'a Function,
        arch: &'a Arc<Arch>,
        loader: &'a dyn Loader,
        mut function_handler: Option<&mut (dyn FunctionHandler + 'h)>,
        init_state: Option<&ReachingDefinitions>,
        settings: &Settings,
        observations: &mut Observations,
        node_iterations: &mut FxHashMap<u64, u32>,
    ) {
        let graph = func.graph();
        let entry = func.entry();

        // reverse postorder: topological where possible, back edges behind
        let mut postorder = Vec::with_capacity(func.len());
        let mut dfs = DfsPostOrder::new(graph, entry);
        while let Some(node) = dfs.next(graph) {
            postorder.push(node);
        }
        postorder.reverse();
        let order: FxHashMap<BlockId, usize> = postorder
            .iter()
            .enumerate()
            .map(|(idx, node)| (*node, idx))
            .collect();

        let mut out_states: FxHashMap<BlockId, ReachingDefinitions> = FxHashMap::default();
        let mut worklist: BTreeSet<usize> = (0..postorder.len()).collect();

        while let Some(idx) = worklist.pop_first() {
            let node = postorder[idx];
            let block = func.block(node);

            let visits = node_iterations.entry(block.addr).or_default();
            if *visits >= settings.max_iterations {
                continue;
            }
            *visits += 1;

            // join the out states of the predecessors; the entry block also
            // receives the initial state
            let incoming: Vec<&ReachingDefinitions> = graph
                .neighbors_directed(node, Direction::Incoming)
                .filter_map(|pred| out_states.get(&pred))
                .collect();
            let in_state = if node == entry || incoming.is_empty() {
                let init = Self::initial_state(arch, loader, init_state, settings, Some(func));
                init.merge(incoming.iter().copied())
            } else {
                let (first, rest) = incoming.split_first().expect("incoming is not empty");
                first.merge(rest.iter().copied())
            };

            let handler = function_handler.as_mut().map(|h| &mut **h);
            let out = Self::process_block(
                block,
                in_state,
                arch,
                loader,
                handler,
                observations,
                settings,
            );

            let changed = out_states.get(&node) != Some(&out);
            out_states.insert(node, out);
            if changed {
                for succ in graph.neighbors_directed(node, Direction::Outgoing) {
                    if let Some(succ_idx) = order.get(&succ) {
                        worklist.insert(*succ_idx);
                    }
                }
            }
        }
    }

    fn initial_state(
        arch: &Arc<Arch>,
        loader: &dyn Loader,
        init_state: Option<&ReachingDefinitions>,
        settings: &Settings,
        func: Option<&Function>,
    ) -> ReachingDefinitions {
        if let Some(seed) = init_state {
            return seed.copy();
        }

        let mut state = ReachingDefinitions::new(arch.clone(), settings.track_tmps);
        if settings.init_func {
            if let Some(func) = func {
                state.init_function(loader, settings.cc.as_ref(), func.addr());
            }
        }
        state
    }

    fn process_block<'a, 'b, 'h>(
        block: &'a Block,
        state: ReachingDefinitions,
        arch: &'a Arc<Arch>,
        loader: &'a dyn Loader,
        handler: Option<&'b mut (dyn FunctionHandler + 'h)>,
        observations: &'b mut Observations,
        settings: &Settings,
    ) -> ReachingDefinitions {
        match &block.ir {
            BlockIr::Vex(vex_block) => VexEngine::new(
                arch,
                loader,
                handler,
                observations,
                settings.current_depth,
                settings.maximum_depth,
                block.addr,
                vex_block,
                state,
            )
            .process(),
            BlockIr::Ail(ail_block) => AilEngine::new(arch, observations, ail_block, state).process(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The recorded snapshots, keyed by `(ins_addr, side)`.
    pub fn observed_results(&self) -> &FxHashMap<ObservationPoint, ReachingDefinitions> {
        &self.observed_results
    }

    /// The single recorded snapshot. Fails unless exactly one observation
    /// fired.
    pub fn one_result(&self) -> Result<&ReachingDefinitions, ResultError> {
        if self.observed_results.len() > 1 {
            return Err(ResultError::Ambiguous);
        }
        self.observed_results
            .values()
            .next()
            .ok_or(ResultError::Empty)
    }

    /// How often each block was visited.
    pub fn node_iterations(&self) -> &FxHashMap<u64, u32> {
        &self.node_iterations
    }

    /// Consumes the analysis, keeping only the snapshots.
    pub fn into_results(self) -> FxHashMap<ObservationPoint, ReachingDefinitions> {
        self.observed_results
    }

    /// Sheds per-run bookkeeping and slims the retained snapshots.
    pub fn downsize(&mut self) {
        self.node_iterations.clear();
        for state in self.observed_results.values_mut() {
            state.downsize();
        }
    }
}
