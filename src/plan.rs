//! The build plan: the set of edges that must run to bring the requested
//! targets up to date, and the scheduling machinery that releases them to
//! the command runner in critical-path order under pool constraints.

use crate::densemap::DenseMap;
use crate::dyndep::DyndepFile;
use crate::graph::{EdgeId, FileId, Graph, PoolId, VisitMark};
use crate::scan::DependencyScan;
use hashbrown::HashMap;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet, VecDeque};

/// Whether and how the plan wants an edge run.  An edge can be in the plan
/// without being wanted when a dependent needed to walk through it but its
/// outputs are already clean.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Want {
    Nothing,
    ToStart,
    ToFinish,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeResult {
    Succeeded,
    Failed,
}

/// Priority queue entry: heavier critical paths first, FIFO among equals.
#[derive(Clone, Copy, PartialEq, Eq)]
struct PrioEdge {
    weight: i64,
    seq: usize,
    id: EdgeId,
}

impl Ord for PrioEdge {
    fn cmp(&self, other: &Self) -> Ordering {
        self.weight
            .cmp(&other.weight)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PrioEdge {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct EdgeHeap {
    heap: BinaryHeap<PrioEdge>,
    seq: usize,
}

impl EdgeHeap {
    fn push(&mut self, id: EdgeId, weight: i64) {
        self.seq += 1;
        self.heap.push(PrioEdge {
            weight,
            seq: self.seq,
            id,
        });
    }

    fn pop(&mut self) -> Option<(EdgeId, i64)> {
        self.heap.pop().map(|p| (p.id, p.weight))
    }

    fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Scheduling state for one pool: the in-flight count and the edges delayed
/// waiting for capacity.  Unlimited pools (depth 0) track neither.
#[derive(Default)]
struct PoolState {
    current_use: usize,
    delayed: EdgeHeap,
}

impl PoolState {
    fn should_delay_edge(&self, depth: usize) -> bool {
        depth != 0 && self.current_use >= depth
    }

    fn delay_edge(&mut self, id: EdgeId, weight: i64) {
        self.delayed.push(id, weight);
    }

    fn edge_scheduled(&mut self, depth: usize) {
        if depth != 0 {
            self.current_use += 1;
        }
    }

    fn edge_finished(&mut self, depth: usize) {
        if depth != 0 && self.current_use > 0 {
            self.current_use -= 1;
        }
    }

    /// Move delayed edges into the ready queue while capacity permits,
    /// highest critical-path weight first.
    fn retrieve_ready_edges(&mut self, depth: usize, ready: &mut EdgeHeap) {
        while !self.delayed.is_empty() {
            if depth != 0 && self.current_use >= depth {
                break;
            }
            let (id, weight) = self.delayed.pop().unwrap();
            ready.push(id, weight);
            self.edge_scheduled(depth);
        }
    }
}

pub struct Plan {
    /// Edges reachable from the targets, and whether we want to run them.
    want: HashMap<EdgeId, Want>,
    /// Edges whose inputs are all ready and whose pool admits them.
    ready: EdgeHeap,
    /// Requested target nodes, deduplicated before critical-path seeding.
    targets: Vec<FileId>,
    pools: DenseMap<PoolId, PoolState>,
    /// Edges with Want != Nothing still outstanding.
    wanted_edges: usize,
    /// Total non-phony edges ever wanted; the status denominator.  Only
    /// restat cleaning subtracts from it.
    command_edges: usize,
    /// Outputs whose dyndep info became loadable; drained by the driver.
    pending_dyndeps: VecDeque<FileId>,
}

impl Plan {
    pub fn new() -> Plan {
        Plan {
            want: HashMap::new(),
            ready: EdgeHeap::default(),
            targets: Vec::new(),
            pools: DenseMap::new(),
            wanted_edges: 0,
            command_edges: 0,
            pending_dyndeps: VecDeque::new(),
        }
    }

    /// There is work to do when a wanted command edge is still outstanding.
    pub fn more_to_do(&self) -> bool {
        self.wanted_edges > 0 && self.command_edges > 0
    }

    pub fn command_edge_count(&self) -> usize {
        self.command_edges
    }

    pub fn wanted_edge_count(&self) -> usize {
        self.wanted_edges
    }

    pub fn want_of(&self, edge: EdgeId) -> Option<Want> {
        self.want.get(&edge).copied()
    }

    pub fn add_target(&mut self, graph: &mut Graph, target: FileId) -> anyhow::Result<()> {
        self.targets.push(target);
        self.add_sub_target(graph, target, None, None)
    }

    fn add_sub_target(
        &mut self,
        graph: &mut Graph,
        node: FileId,
        dependent: Option<FileId>,
        mut dyndep_walk: Option<&mut HashSet<EdgeId>>,
    ) -> anyhow::Result<()> {
        let edge = match graph.file(node).in_edge {
            None => {
                // Leaf node: a regular source, or an implicit input named by
                // a depfile or dyndep file.  A dirty (missing) source stops
                // the build; a missing dep-loader input just means the edge
                // that listed it will rebuild and refresh its deps.
                if graph.file(node).dirty && !graph.file(node).generated_by_dep_loader {
                    let referenced = match dependent {
                        Some(d) => format!(", needed by '{}',", graph.file(d).name),
                        None => String::new(),
                    };
                    anyhow::bail!(
                        "'{}'{} missing and no known rule to make it",
                        graph.file(node).name,
                        referenced
                    );
                }
                return Ok(());
            }
            Some(edge) => edge,
        };

        if graph.edge(edge).outputs_ready {
            return Ok(());
        }

        let existing = self.want.get(&edge).copied();
        let mut want = existing.unwrap_or(Want::Nothing);

        // An already-scheduled edge reached through a dyndep walk needs no
        // further processing.
        if dyndep_walk.is_some() && want == Want::ToFinish {
            return Ok(());
        }

        if graph.file(node).dirty && want == Want::Nothing {
            want = Want::ToStart;
            self.edge_wanted(graph, edge);
        }
        self.want.insert(edge, want);

        if let Some(walk) = dyndep_walk.as_deref_mut() {
            walk.insert(edge);
        }

        if existing.is_some() {
            // The edge's inputs were already walked.
            return Ok(());
        }

        for i in 0..graph.edge(edge).ins.ids.len() {
            let input = graph.edge(edge).ins.ids[i];
            self.add_sub_target(graph, input, Some(node), dyndep_walk.as_deref_mut())?;
        }
        Ok(())
    }

    fn edge_wanted(&mut self, graph: &Graph, edge: EdgeId) {
        self.wanted_edges += 1;
        if !graph.edge(edge).is_phony() {
            self.command_edges += 1;
        }
    }

    /// Pop the highest-priority edge that is ready to run.
    pub fn find_work(&mut self) -> Option<EdgeId> {
        self.ready.pop().map(|(id, _)| id)
    }

    fn schedule_work(&mut self, graph: &Graph, edge: EdgeId) {
        match self.want.get_mut(&edge) {
            Some(want @ Want::ToStart) => *want = Want::ToFinish,
            Some(Want::ToFinish) => {
                // Already scheduled; happens when an edge and one of its
                // dependencies share an order-only input.
                return;
            }
            other => panic!("scheduling edge with want {:?}", other),
        }

        let pool_id = graph.edge(edge).pool;
        let depth = graph.pool(pool_id).depth;
        let weight = graph.edge(edge).critical_path_weight;
        let pool = self.pools.get_grow(pool_id);
        if pool.should_delay_edge(depth) {
            pool.delay_edge(edge, weight);
            pool.retrieve_ready_edges(depth, &mut self.ready);
        } else {
            pool.edge_scheduled(depth);
            self.ready.push(edge, weight);
        }
    }

    /// Record completion of a started (or passed-through) edge.  On success
    /// the edge leaves the plan and its consumers are re-checked; a failed
    /// edge is retained so the driver can fail the rest of the graph
    /// coherently.
    pub fn edge_finished(
        &mut self,
        graph: &mut Graph,
        edge: EdgeId,
        result: EdgeResult,
    ) -> anyhow::Result<()> {
        let directly_wanted = match self.want.get(&edge) {
            Some(want) => *want != Want::Nothing,
            None => panic!("edge_finished on edge not in plan"),
        };

        // This completion may free up a delayed edge in the pool.
        let pool_id = graph.edge(edge).pool;
        let depth = graph.pool(pool_id).depth;
        let pool = self.pools.get_grow(pool_id);
        if directly_wanted {
            pool.edge_finished(depth);
        }
        pool.retrieve_ready_edges(depth, &mut self.ready);

        if result != EdgeResult::Succeeded {
            return Ok(());
        }

        if directly_wanted {
            self.wanted_edges -= 1;
        }
        self.want.remove(&edge);
        graph.edge_mut(edge).outputs_ready = true;

        for i in 0..graph.edge(edge).outs.ids.len() {
            let output = graph.edge(edge).outs.ids[i];
            self.node_finished(graph, output)?;
        }
        Ok(())
    }

    fn node_finished(&mut self, graph: &mut Graph, node: FileId) -> anyhow::Result<()> {
        if graph.file(node).dyndep_pending {
            // The driver loads the file and feeds it back through
            // dyndeps_loaded, which performs the readiness walk this node's
            // consumers would otherwise get here.
            self.pending_dyndeps.push_back(node);
            return Ok(());
        }

        for i in 0..graph.file(node).out_edges.len() {
            let oe = graph.file(node).out_edges[i];
            if self.want.contains_key(&oe) {
                self.edge_maybe_ready(graph, oe)?;
            }
        }
        Ok(())
    }

    fn edge_maybe_ready(&mut self, graph: &mut Graph, edge: EdgeId) -> anyhow::Result<()> {
        if !graph.all_inputs_ready(edge) {
            return Ok(());
        }
        match self.want.get(&edge) {
            None => Ok(()),
            Some(Want::Nothing) => {
                // Not ours to run, but readiness must flow through to the
                // edges beyond it.
                self.edge_finished(graph, edge, EdgeResult::Succeeded)
            }
            Some(_) => {
                self.schedule_work(graph, edge);
                Ok(())
            }
        }
    }

    /// A dyndep-providing output became ready; the driver pops these and
    /// calls back with the loaded file.
    pub fn pop_pending_dyndep(&mut self) -> Option<FileId> {
        self.pending_dyndeps.pop_front()
    }

    /// A restat rule left `node` unchanged: propagate cleanliness downstream,
    /// demoting edges whose outputs turn out to be up to date after all.
    pub fn clean_node(
        &mut self,
        graph: &mut Graph,
        scan: &DependencyScan,
        node: FileId,
    ) -> anyhow::Result<()> {
        graph.file_mut(node).dirty = false;

        for i in 0..graph.file(node).out_edges.len() {
            let oe = graph.file(node).out_edges[i];
            match self.want.get(&oe) {
                None | Some(Want::Nothing) => continue,
                _ => {}
            }
            // An edge that failed to load deps must run regardless.
            if graph.edge(oe).deps_missing {
                continue;
            }

            let all_inputs_clean = graph
                .edge(oe)
                .ins
                .non_order_only()
                .iter()
                .all(|&input| !graph.file(input).dirty);
            if !all_inputs_clean {
                continue;
            }

            let most_recent = graph.most_recent_input(oe);
            let outputs_dirty = scan.recompute_outputs_dirty(graph, oe, most_recent)?;
            if !outputs_dirty {
                for j in 0..graph.edge(oe).outs.ids.len() {
                    let out = graph.edge(oe).outs.ids[j];
                    self.clean_node(graph, scan, out)?;
                }
                *self.want.get_mut(&oe).unwrap() = Want::Nothing;
                self.wanted_edges -= 1;
                if !graph.edge(oe).is_phony() {
                    self.command_edges -= 1;
                }
            }
        }
        Ok(())
    }

    /// Incorporate freshly loaded dyndep info for `node`: recompute dirty
    /// state of its dependents, pull the newly implied subgraph into the
    /// plan, then run the readiness checks that `node_finished` skipped when
    /// it signaled the pending dyndep.
    pub fn dyndeps_loaded(
        &mut self,
        graph: &mut Graph,
        scan: &DependencyScan,
        node: FileId,
        ddf: &DyndepFile,
    ) -> anyhow::Result<()> {
        self.refresh_dyndep_dependents(graph, scan, node)?;

        // Edges already in the plan whose dyndep info arrived; the rest of
        // the file describes edges nothing depends on yet.
        let mut dyndep_roots: Vec<EdgeId> = Vec::new();
        for entry in ddf.iter() {
            let edge = entry.0;
            if graph.edge(edge).outputs_ready {
                continue;
            }
            if !self.want.contains_key(&edge) {
                continue;
            }
            dyndep_roots.push(edge);
        }

        let mut dyndep_walk: HashSet<EdgeId> = HashSet::new();
        for root in dyndep_roots {
            let dependent = graph.edge(root).outs.ids[0];
            let inputs = ddf.get(&root).unwrap().implicit_ins.clone();
            for input in inputs {
                self.add_sub_target(graph, input, Some(dependent), Some(&mut dyndep_walk))?;
            }
        }

        // The consumers of the dyndep file itself, just as node_finished
        // would have visited without the dyndep path.
        for i in 0..graph.file(node).out_edges.len() {
            let oe = graph.file(node).out_edges[i];
            if self.want.contains_key(&oe) {
                dyndep_walk.insert(oe);
            }
        }

        let mut walk: Vec<EdgeId> = dyndep_walk.into_iter().collect();
        walk.sort();
        for edge in walk {
            if self.want.contains_key(&edge) {
                self.edge_maybe_ready(graph, edge)?;
            }
        }
        Ok(())
    }

    fn refresh_dyndep_dependents(
        &mut self,
        graph: &mut Graph,
        scan: &DependencyScan,
        node: FileId,
    ) -> anyhow::Result<()> {
        let mut dependents: HashSet<FileId> = HashSet::new();
        self.unmark_dependents(graph, node, &mut dependents);
        let mut dependents: Vec<FileId> = dependents.into_iter().collect();
        dependents.sort();

        for n in dependents {
            let mut validations = Vec::new();
            scan.recompute_dirty(graph, n, &mut validations)?;

            for v in validations {
                if let Some(in_edge) = graph.file(v).in_edge {
                    if !graph.edge(in_edge).outputs_ready {
                        self.add_target(graph, v)?;
                    }
                }
            }

            if !graph.file(n).dirty {
                continue;
            }
            // The edge was walked before without being wanted; with dyndep
            // info its output is now known dirty, so we want it.
            let edge = graph.file(n).in_edge.expect("dirty dependent with no producer");
            assert!(!graph.edge(edge).outputs_ready);
            let want = *self.want.get(&edge).expect("dependent edge not in plan");
            if want == Want::Nothing {
                self.want.insert(edge, Want::ToStart);
                self.edge_wanted(graph, edge);
            }
        }
        Ok(())
    }

    /// Transitive dependents of `node` reached through planned edges, with
    /// the scan marks reset so recompute_dirty revisits them.
    fn unmark_dependents(
        &mut self,
        graph: &mut Graph,
        node: FileId,
        dependents: &mut HashSet<FileId>,
    ) {
        for i in 0..graph.file(node).out_edges.len() {
            let edge = graph.file(node).out_edges[i];
            if !self.want.contains_key(&edge) {
                continue;
            }
            if graph.edge(edge).mark != VisitMark::None {
                graph.edge_mut(edge).mark = VisitMark::None;
                for j in 0..graph.edge(edge).outs.ids.len() {
                    let out = graph.edge(edge).outs.ids[j];
                    if dependents.insert(out) {
                        self.unmark_dependents(graph, out, dependents);
                    }
                }
            }
        }
    }

    /// Backflow pass assigning each edge the weight of the heaviest
    /// (phony-discounted) path from it to any target.  Pools are ignored.
    fn compute_critical_path(&mut self, graph: &mut Graph) {
        let mut seen = HashSet::new();
        self.targets.retain(|&t| seen.insert(t));

        fn edge_weight(graph: &Graph, edge: EdgeId) -> i64 {
            if graph.edge(edge).is_phony() {
                0
            } else {
                1
            }
        }

        let mut queue: VecDeque<EdgeId> = VecDeque::new();
        let mut active: HashSet<EdgeId> = HashSet::new();

        for &target in &self.targets {
            if let Some(edge) = graph.file(target).in_edge {
                let weight = edge_weight(graph, edge).max(graph.edge(edge).critical_path_weight);
                graph.edge_mut(edge).critical_path_weight = weight;
                if active.insert(edge) {
                    queue.push_back(edge);
                }
            }
        }

        while let Some(edge) = queue.pop_front() {
            active.remove(&edge);
            for i in 0..graph.edge(edge).ins.ids.len() {
                let input = graph.edge(edge).ins.ids[i];
                let in_edge = match graph.file(input).in_edge {
                    None => continue,
                    Some(e) => e,
                };
                let proposed =
                    graph.edge(edge).critical_path_weight + edge_weight(graph, in_edge);
                if proposed > graph.edge(in_edge).critical_path_weight {
                    graph.edge_mut(in_edge).critical_path_weight = proposed;
                    if active.insert(in_edge) {
                        queue.push_back(in_edge);
                    }
                }
            }
        }
    }

    /// Queue every wanted edge whose inputs are already ready.  Finite pools
    /// are drained once at the end so their highest-priority edges surface
    /// first rather than whichever the want map yields first.
    fn schedule_initial_edges(&mut self, graph: &Graph) {
        assert!(self.ready.is_empty());

        let mut ids: Vec<EdgeId> = self
            .want
            .iter()
            .filter(|(_, want)| **want == Want::ToStart)
            .map(|(&edge, _)| edge)
            .collect();
        ids.sort();

        let mut touched_pools: HashSet<PoolId> = HashSet::new();
        for id in ids {
            if !graph.all_inputs_ready(id) {
                continue;
            }
            let pool_id = graph.edge(id).pool;
            let depth = graph.pool(pool_id).depth;
            if depth != 0 {
                let weight = graph.edge(id).critical_path_weight;
                self.pools.get_grow(pool_id).delay_edge(id, weight);
                touched_pools.insert(pool_id);
            } else {
                self.schedule_work(graph, id);
            }
        }

        let mut touched: Vec<PoolId> = touched_pools.into_iter().collect();
        touched.sort();
        for pool_id in touched {
            let depth = graph.pool(pool_id).depth;
            self.pools
                .get_grow(pool_id)
                .retrieve_ready_edges(depth, &mut self.ready);
        }
    }

    pub fn prepare_queue(&mut self, graph: &mut Graph) {
        self.compute_critical_path(graph);
        self.schedule_initial_edges(graph);
    }
}

impl Default for Plan {
    fn default() -> Self {
        Plan::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{BuildLog, DepsLog};
    use crate::graph::{Edge, EdgeIns, EdgeOuts};
    use crate::testing::TestDisk;

    fn add_edge(
        g: &mut Graph,
        rule: &str,
        cmdline: Option<&str>,
        outs: &[&str],
        ins: &[&str],
    ) -> EdgeId {
        let ins: Vec<FileId> = ins.iter().map(|name| g.file_id(*name)).collect();
        let outs: Vec<FileId> = outs.iter().map(|name| g.file_id(*name)).collect();
        let mut edge = Edge::new(rule);
        edge.cmdline = cmdline.map(str::to_string);
        edge.ins = EdgeIns::explicit(ins);
        edge.outs = EdgeOuts::explicit(outs);
        g.add_edge(edge).unwrap()
    }

    fn cmd_edge(g: &mut Graph, outs: &[&str], ins: &[&str]) -> EdgeId {
        add_edge(g, "cc", Some("cc"), outs, ins)
    }

    fn phony_edge(g: &mut Graph, outs: &[&str], ins: &[&str]) -> EdgeId {
        add_edge(g, "phony", None, outs, ins)
    }

    fn mark_dirty(g: &mut Graph, names: &[&str]) {
        for name in names {
            let id = g.file_id(*name);
            g.file_mut(id).dirty = true;
        }
    }

    fn want_target(g: &mut Graph, plan: &mut Plan, name: &str) {
        let id = g.file_id(name);
        plan.add_target(g, id).unwrap();
    }

    #[test]
    fn dirty_target_is_wanted() {
        let mut g = Graph::new();
        let edge = cmd_edge(&mut g, &["a.o"], &["a.c"]);
        mark_dirty(&mut g, &["a.o"]);

        let mut plan = Plan::new();
        want_target(&mut g, &mut plan, "a.o");
        assert_eq!(plan.want_of(edge), Some(Want::ToStart));
        assert_eq!(plan.wanted_edge_count(), 1);
        assert_eq!(plan.command_edge_count(), 1);
        assert!(plan.more_to_do());
    }

    #[test]
    fn clean_target_is_not_wanted() {
        let mut g = Graph::new();
        let edge = cmd_edge(&mut g, &["a.o"], &["a.c"]);

        let mut plan = Plan::new();
        want_target(&mut g, &mut plan, "a.o");
        assert_eq!(plan.want_of(edge), Some(Want::Nothing));
        assert!(!plan.more_to_do());
    }

    #[test]
    fn add_target_twice_is_idempotent() {
        let mut g = Graph::new();
        cmd_edge(&mut g, &["a.o"], &["a.c"]);
        mark_dirty(&mut g, &["a.o"]);

        let mut plan = Plan::new();
        want_target(&mut g, &mut plan, "a.o");
        let (wanted, commands) = (plan.wanted_edge_count(), plan.command_edge_count());
        want_target(&mut g, &mut plan, "a.o");
        assert_eq!(plan.wanted_edge_count(), wanted);
        assert_eq!(plan.command_edge_count(), commands);
    }

    #[test]
    fn missing_source_is_an_error() {
        let mut g = Graph::new();
        cmd_edge(&mut g, &["a.o"], &["a.c"]);
        mark_dirty(&mut g, &["a.o", "a.c"]);

        let mut plan = Plan::new();
        let target = g.file_id("a.o");
        let err = plan.add_target(&mut g, target).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("missing and no known rule to make it"), "{}", msg);
        assert!(msg.contains("needed by 'a.o'"), "{}", msg);
    }

    #[test]
    fn missing_dep_loader_input_is_tolerated() {
        let mut g = Graph::new();
        let edge = cmd_edge(&mut g, &["a.o"], &["gone.h"]);
        mark_dirty(&mut g, &["a.o", "gone.h"]);
        let gone = g.file_id("gone.h");
        g.file_mut(gone).generated_by_dep_loader = true;

        let mut plan = Plan::new();
        want_target(&mut g, &mut plan, "a.o");
        assert_eq!(plan.want_of(edge), Some(Want::ToStart));
    }

    #[test]
    fn critical_path_prefers_long_chains() {
        let mut g = Graph::new();
        // top depends on a two-step chain and a one-step branch.
        let e_deep = cmd_edge(&mut g, &["m0"], &["src"]);
        let e_mid = cmd_edge(&mut g, &["m1"], &["m0"]);
        let e_side = cmd_edge(&mut g, &["s1"], &["src"]);
        let e_top = cmd_edge(&mut g, &["top"], &["m1", "s1"]);
        mark_dirty(&mut g, &["m0", "m1", "s1", "top"]);

        let mut plan = Plan::new();
        want_target(&mut g, &mut plan, "top");
        plan.prepare_queue(&mut g);

        assert_eq!(g.edge(e_top).critical_path_weight, 1);
        assert_eq!(g.edge(e_mid).critical_path_weight, 2);
        assert_eq!(g.edge(e_deep).critical_path_weight, 3);
        assert_eq!(g.edge(e_side).critical_path_weight, 2);

        // The deep chain's leaf runs first.
        assert_eq!(plan.find_work(), Some(e_deep));
        assert_eq!(plan.find_work(), Some(e_side));
        assert_eq!(plan.find_work(), None);
    }

    #[test]
    fn phony_edges_are_weightless() {
        let mut g = Graph::new();
        let e_x = cmd_edge(&mut g, &["x"], &["src"]);
        let e_all = phony_edge(&mut g, &["all"], &["x"]);
        mark_dirty(&mut g, &["x", "all"]);

        let mut plan = Plan::new();
        want_target(&mut g, &mut plan, "all");
        plan.prepare_queue(&mut g);

        assert_eq!(g.edge(e_all).critical_path_weight, 0);
        assert_eq!(g.edge(e_x).critical_path_weight, 1);
    }

    #[test]
    fn weights_propagate_through_phony_chains() {
        let mut g = Graph::new();
        let e_cmd = cmd_edge(&mut g, &["x"], &["src"]);
        let e_inner = phony_edge(&mut g, &["group"], &["x"]);
        let e_outer = phony_edge(&mut g, &["all"], &["group"]);
        mark_dirty(&mut g, &["x", "group", "all"]);

        let mut plan = Plan::new();
        want_target(&mut g, &mut plan, "all");
        plan.prepare_queue(&mut g);

        assert_eq!(g.edge(e_outer).critical_path_weight, 0);
        assert_eq!(g.edge(e_inner).critical_path_weight, 0);
        // The command edge still counts itself even under phony grouping.
        assert_eq!(g.edge(e_cmd).critical_path_weight, 1);
    }

    #[test]
    fn equal_weights_pop_in_insertion_order() {
        let mut g = Graph::new();
        let e1 = cmd_edge(&mut g, &["a"], &[]);
        let e2 = cmd_edge(&mut g, &["b"], &[]);
        mark_dirty(&mut g, &["a", "b"]);

        let mut plan = Plan::new();
        want_target(&mut g, &mut plan, "a");
        want_target(&mut g, &mut plan, "b");
        plan.prepare_queue(&mut g);

        assert_eq!(plan.find_work(), Some(e1));
        assert_eq!(plan.find_work(), Some(e2));
    }

    #[test]
    fn finish_releases_dependents() {
        let mut g = Graph::new();
        let e_obj = cmd_edge(&mut g, &["a.o"], &["a.c"]);
        let e_bin = cmd_edge(&mut g, &["app"], &["a.o"]);
        mark_dirty(&mut g, &["a.o", "app"]);

        let mut plan = Plan::new();
        want_target(&mut g, &mut plan, "app");
        plan.prepare_queue(&mut g);

        assert_eq!(plan.find_work(), Some(e_obj));
        assert_eq!(plan.find_work(), None);
        plan.edge_finished(&mut g, e_obj, EdgeResult::Succeeded).unwrap();
        assert!(g.edge(e_obj).outputs_ready);
        assert_eq!(plan.want_of(e_obj), None);
        assert_eq!(plan.find_work(), Some(e_bin));
    }

    #[test]
    fn failed_edge_is_retained() {
        let mut g = Graph::new();
        let e_obj = cmd_edge(&mut g, &["a.o"], &["a.c"]);
        let e_bin = cmd_edge(&mut g, &["app"], &["a.o"]);
        mark_dirty(&mut g, &["a.o", "app"]);

        let mut plan = Plan::new();
        want_target(&mut g, &mut plan, "app");
        plan.prepare_queue(&mut g);

        assert_eq!(plan.find_work(), Some(e_obj));
        plan.edge_finished(&mut g, e_obj, EdgeResult::Failed).unwrap();
        assert!(!g.edge(e_obj).outputs_ready);
        assert!(plan.want_of(e_obj).is_some());
        assert_eq!(plan.want_of(e_bin), Some(Want::ToStart));
        assert_eq!(plan.find_work(), None);
        assert!(plan.more_to_do());
    }

    #[test]
    fn shared_producer_schedules_consumer_once() {
        let mut g = Graph::new();
        // One edge produces both inputs of the consumer.
        let e_gen = cmd_edge(&mut g, &["a.h", "a.c"], &["a.in"]);
        let e_use = cmd_edge(&mut g, &["a.o"], &["a.h", "a.c"]);
        mark_dirty(&mut g, &["a.h", "a.c", "a.o"]);

        let mut plan = Plan::new();
        want_target(&mut g, &mut plan, "a.o");
        plan.prepare_queue(&mut g);

        assert_eq!(plan.find_work(), Some(e_gen));
        plan.edge_finished(&mut g, e_gen, EdgeResult::Succeeded).unwrap();
        // Both outputs re-checked the consumer; it must be queued once.
        assert_eq!(plan.find_work(), Some(e_use));
        assert_eq!(plan.find_work(), None);
    }

    #[test]
    fn unwanted_edge_passes_readiness_through() {
        let mut g = Graph::new();
        let e_x = cmd_edge(&mut g, &["x"], &["src"]);
        let e_phony = phony_edge(&mut g, &["alias"], &["x"]);
        let e_final = cmd_edge(&mut g, &["out"], &["alias"]);
        mark_dirty(&mut g, &["x", "out"]); // alias itself is clean

        let mut plan = Plan::new();
        want_target(&mut g, &mut plan, "out");
        assert_eq!(plan.want_of(e_phony), Some(Want::Nothing));
        plan.prepare_queue(&mut g);

        assert_eq!(plan.find_work(), Some(e_x));
        plan.edge_finished(&mut g, e_x, EdgeResult::Succeeded).unwrap();
        // The phony edge was finished in passing, not scheduled.
        assert_eq!(plan.want_of(e_phony), None);
        assert!(g.edge(e_phony).outputs_ready);
        assert_eq!(plan.find_work(), Some(e_final));
    }

    #[test]
    fn pool_depth_one_serializes() {
        let mut g = Graph::new();
        let pool = g.add_pool("link", 1).unwrap();
        let e1 = cmd_edge(&mut g, &["b1"], &[]);
        let e2 = cmd_edge(&mut g, &["b2"], &[]);
        let e3 = cmd_edge(&mut g, &["b3"], &[]);
        for e in [e1, e2, e3] {
            g.edge_mut(e).pool = pool;
        }
        // Give b2 a consumer so its edge carries more weight.
        let e_post = cmd_edge(&mut g, &["post"], &["b2"]);
        mark_dirty(&mut g, &["b1", "b2", "b3", "post"]);

        let mut plan = Plan::new();
        for t in ["b1", "b3", "post"] {
            want_target(&mut g, &mut plan, t);
        }
        plan.prepare_queue(&mut g);

        // Highest weight first, then insertion order, one at a time.
        assert_eq!(plan.find_work(), Some(e2));
        assert_eq!(plan.find_work(), None);
        plan.edge_finished(&mut g, e2, EdgeResult::Succeeded).unwrap();
        // Freed slot goes to e1; the non-pool consumer is also ready now.
        let mut next = vec![plan.find_work().unwrap(), plan.find_work().unwrap()];
        next.sort();
        assert_eq!(next, vec![e1, e_post]);
        assert_eq!(plan.find_work(), None);
        plan.edge_finished(&mut g, e1, EdgeResult::Succeeded).unwrap();
        assert_eq!(plan.find_work(), Some(e3));
    }

    #[test]
    fn console_pool_is_serialized_by_default() {
        let mut g = Graph::new();
        let e1 = cmd_edge(&mut g, &["i1"], &[]);
        let e2 = cmd_edge(&mut g, &["i2"], &[]);
        g.edge_mut(e1).pool = Graph::CONSOLE_POOL;
        g.edge_mut(e2).pool = Graph::CONSOLE_POOL;
        assert!(g.edge(e1).use_console());
        mark_dirty(&mut g, &["i1", "i2"]);

        let mut plan = Plan::new();
        want_target(&mut g, &mut plan, "i1");
        want_target(&mut g, &mut plan, "i2");
        plan.prepare_queue(&mut g);

        assert_eq!(plan.find_work(), Some(e1));
        assert_eq!(plan.find_work(), None);
        plan.edge_finished(&mut g, e1, EdgeResult::Succeeded).unwrap();
        assert_eq!(plan.find_work(), Some(e2));
    }

    #[test]
    fn clean_node_demotes_up_to_date_consumers() {
        let disk = TestDisk::new();
        disk.add("o", "");
        disk.add("final", ""); // newer than o
        let mut g = Graph::new();
        let e_o = cmd_edge(&mut g, &["o"], &[]);
        let e_final = cmd_edge(&mut g, &["final"], &["o"]);
        mark_dirty(&mut g, &["o", "final"]);

        let mut plan = Plan::new();
        want_target(&mut g, &mut plan, "final");
        plan.prepare_queue(&mut g);
        assert_eq!(plan.command_edge_count(), 2);

        assert_eq!(plan.find_work(), Some(e_o));

        // The command left o unchanged; the driver propagates the clean
        // state before reporting the edge finished.
        let scan = DependencyScan::new(&disk, BuildLog::in_memory(), DepsLog::in_memory(), false);
        let o = g.lookup_file("o").unwrap();
        plan.clean_node(&mut g, &scan, o).unwrap();
        assert_eq!(plan.want_of(e_final), Some(Want::Nothing));
        assert_eq!(plan.command_edge_count(), 1);
        plan.edge_finished(&mut g, e_o, EdgeResult::Succeeded).unwrap();

        // Completion passed readiness through the demoted edge instead of
        // scheduling it.
        assert_eq!(plan.want_of(e_final), None);
        assert_eq!(plan.find_work(), None);
        assert!(!g.file(g.lookup_file("final").unwrap()).dirty);
        assert!(!plan.more_to_do());
    }

    #[test]
    fn dyndep_discovery_schedules_new_work_first() {
        let disk = TestDisk::new();
        disk.add("src", "");
        disk.add("hdr.in", "");
        let mut g = Graph::new();

        let e_dd = cmd_edge(&mut g, &["dd"], &["src"]);
        let e_hdr = cmd_edge(&mut g, &["h.h"], &["hdr.in"]);
        let dd = g.file_id("dd");
        let src = g.file_id("src");
        let out = g.file_id("t.o");
        let mut edge = Edge::new("cc");
        edge.cmdline = Some("cc t.c".to_string());
        edge.ins = EdgeIns::new(vec![src, dd], 1, 0);
        edge.outs = EdgeOuts::explicit(vec![out]);
        edge.dyndep = Some(dd);
        let e_target = g.add_edge(edge).unwrap();

        let scan = DependencyScan::new(&disk, BuildLog::in_memory(), DepsLog::in_memory(), false);
        scan.recompute_dirty(&mut g, out, &mut Vec::new()).unwrap();
        assert!(g.file(out).dirty);

        let mut plan = Plan::new();
        plan.add_target(&mut g, out).unwrap();
        plan.prepare_queue(&mut g);
        // The header producer is not part of the plan yet.
        assert_eq!(plan.want_of(e_hdr), None);

        assert_eq!(plan.find_work(), Some(e_dd));
        // "Run" the dyndep producer.
        disk.add("dd", "ninja_dyndep_version = 1\nbuild t.o : dyndep | h.h\n");
        plan.edge_finished(&mut g, e_dd, EdgeResult::Succeeded).unwrap();

        // The completion parked the dyndep load for the driver.
        let pending = plan.pop_pending_dyndep().unwrap();
        assert_eq!(pending, dd);
        let ddf = scan.load_dyndeps(&mut g, pending).unwrap();
        plan.dyndeps_loaded(&mut g, &scan, pending, &ddf).unwrap();

        // The discovered producer is wanted and runs before the target.
        assert_eq!(plan.want_of(e_hdr), Some(Want::ToFinish));
        assert_eq!(plan.find_work(), Some(e_hdr));
        assert_eq!(plan.find_work(), None);
        plan.edge_finished(&mut g, e_hdr, EdgeResult::Succeeded).unwrap();
        assert_eq!(plan.find_work(), Some(e_target));
    }

    #[test]
    fn counters_reach_zero_when_plan_drains() {
        let mut g = Graph::new();
        let e_obj = cmd_edge(&mut g, &["a.o"], &[]);
        let e_all = phony_edge(&mut g, &["all"], &["a.o"]);
        mark_dirty(&mut g, &["a.o", "all"]);

        let mut plan = Plan::new();
        want_target(&mut g, &mut plan, "all");
        plan.prepare_queue(&mut g);
        assert_eq!(plan.wanted_edge_count(), 2);
        assert_eq!(plan.command_edge_count(), 1);

        let e = plan.find_work().unwrap();
        assert_eq!(e, e_obj);
        plan.edge_finished(&mut g, e, EdgeResult::Succeeded).unwrap();
        // The phony aggregate became ready and runs without a command.
        assert_eq!(plan.find_work(), Some(e_all));
        plan.edge_finished(&mut g, e_all, EdgeResult::Succeeded).unwrap();
        assert_eq!(plan.wanted_edge_count(), 0);
        assert!(!plan.more_to_do());
    }
}
