use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::Serialize;

use crate::decision::{Decision, RoutingError};
use crate::engine::error::EngineError;
use crate::engine::types::ExecutionState;

/// Node ids of the campaign graph.
pub mod ids {
    pub const LOAD_CONTEXT: &str = "load_context";
    pub const ANALYZE_FILES: &str = "analyze_files";
    pub const ROUTER: &str = "router";
    pub const DISCOVERY: &str = "discovery";
    pub const DATA_COLLECTION: &str = "data_collection";
    pub const INSIGHT: &str = "insight";
    pub const CAMPAIGN_SETUP: &str = "campaign_setup";
    pub const REFLECTION: &str = "reflection";
    pub const ADJUSTMENT: &str = "adjustment";
    pub const SAVE: &str = "save";
}

/// Values of the `current_phase` business field.
pub mod phase {
    pub const INITIALIZED: &str = "initialized";
    pub const STRATEGY_BUILT: &str = "strategy_built";
    pub const AWAITING_RESULTS: &str = "awaiting_results";
    pub const OPTIMIZING: &str = "optimizing";
}

/// Business field holding the phase marker consulted for `continue`.
pub const PHASE_FIELD: &str = "current_phase";

/// Outgoing edges of the branch node.
#[derive(Debug, Clone, Serialize)]
pub struct BranchRoutes {
    pub initialize: String,
    pub reflect: String,
    pub enrich: String,
    /// `continue` is resolved by the project's current phase.
    pub continue_by_phase: BTreeMap<String, String>,
    /// Target for unrecognized decisions and unmapped phases.
    pub fallback: String,
}

impl BranchRoutes {
    fn targets(&self) -> impl Iterator<Item = &String> {
        [&self.initialize, &self.reflect, &self.enrich, &self.fallback]
            .into_iter()
            .chain(self.continue_by_phase.values())
    }
}

/// Where the branch goes next, plus a warning when the fallback was used.
#[derive(Debug, Clone)]
pub struct BranchResolution {
    pub next: String,
    pub warning: Option<RoutingError>,
}

/// Fixed node set, static edge table and a single dynamic branch.
#[derive(Debug, Clone)]
pub struct GraphDefinition {
    nodes: Vec<String>,
    entry: String,
    branch: String,
    terminal: String,
    edges: HashMap<String, String>,
    routes: BranchRoutes,
}

impl GraphDefinition {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::default()
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn terminal(&self) -> &str {
        &self.terminal
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn routes(&self) -> &BranchRoutes {
        &self.routes
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.iter().any(|n| n == node)
    }

    pub fn is_branch(&self, node: &str) -> bool {
        self.branch == node
    }

    pub fn is_terminal(&self, node: &str) -> bool {
        self.terminal == node
    }

    /// Static successor of `node`. `None` for the branch and the terminal.
    pub fn successor(&self, node: &str) -> Option<&str> {
        self.edges.get(node).map(String::as_str)
    }

    /// Static edges in node declaration order.
    pub fn edges(&self) -> Vec<(&str, &str)> {
        self.nodes
            .iter()
            .filter_map(|n| self.edges.get(n).map(|to| (n.as_str(), to.as_str())))
            .collect()
    }

    /// Map a decision and phase marker to the branch's next node.
    ///
    /// Pure: depends only on its arguments, so the same persisted state always
    /// routes the same way.
    pub fn route(&self, decision: Option<&Decision>, phase: Option<&str>) -> BranchResolution {
        let r = &self.routes;
        let fallback = |label: String| BranchResolution {
            next: r.fallback.clone(),
            warning: Some(RoutingError {
                label,
                fallback: r.fallback.clone(),
            }),
        };
        let hit = |next: &String| BranchResolution {
            next: next.clone(),
            warning: None,
        };

        match decision {
            Some(Decision::Initialize) => hit(&r.initialize),
            Some(Decision::Reflect) => hit(&r.reflect),
            Some(Decision::Enrich) => hit(&r.enrich),
            Some(Decision::Continue) => match phase.and_then(|p| r.continue_by_phase.get(p)) {
                Some(next) => hit(next),
                None => fallback(format!("continue (phase '{}')", phase.unwrap_or("none"))),
            },
            Some(Decision::Unrecognized(label)) => fallback(label.clone()),
            None => fallback("<none>".to_string()),
        }
    }

    /// Structural problems with this graph; empty when it is usable.
    pub fn validate(&self) -> Vec<String> {
        GraphBuilder {
            nodes: self.nodes.clone(),
            entry: Some(self.entry.clone()),
            terminal: Some(self.terminal.clone()),
            branch: Some((self.branch.clone(), self.routes.clone())),
            edges: self
                .edges()
                .into_iter()
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .collect(),
        }
        .validate()
    }

    /// Route from the decision and phase stored in `state`.
    pub fn resolve_branch(&self, state: &ExecutionState) -> BranchResolution {
        self.route(state.decision.as_ref(), state.field_str(PHASE_FIELD))
    }
}

/// Assembles and validates a [`GraphDefinition`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<String>,
    entry: Option<String>,
    terminal: Option<String>,
    branch: Option<(String, BranchRoutes)>,
    edges: Vec<(String, String)>,
}

impl GraphBuilder {
    pub fn nodes<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nodes.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn entry(mut self, id: &str) -> Self {
        self.entry = Some(id.to_string());
        self
    }

    pub fn terminal(mut self, id: &str) -> Self {
        self.terminal = Some(id.to_string());
        self
    }

    pub fn edge(mut self, from: &str, to: &str) -> Self {
        self.edges.push((from.to_string(), to.to_string()));
        self
    }

    pub fn branch(mut self, id: &str, routes: BranchRoutes) -> Self {
        self.branch = Some((id.to_string(), routes));
        self
    }

    /// Every structural problem with the graph; empty when it is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let known: HashSet<&str> = self.nodes.iter().map(String::as_str).collect();

        if known.len() != self.nodes.len() {
            errors.push("Duplicate node ids".to_string());
        }

        let mut check = |role: &str, id: Option<&String>| match id {
            None => errors.push(format!("No {} node declared", role.to_lowercase())),
            Some(id) if !known.contains(id.as_str()) => {
                errors.push(format!("{} node '{}' is not a graph node", role, id))
            }
            _ => {}
        };
        check("Entry", self.entry.as_ref());
        check("Terminal", self.terminal.as_ref());
        check("Branch", self.branch.as_ref().map(|(id, _)| id));

        let mut outgoing: HashMap<&str, &str> = HashMap::new();
        for (from, to) in &self.edges {
            for end in [from, to] {
                if !known.contains(end.as_str()) {
                    errors.push(format!("Edge {} -> {} references unknown node '{}'", from, to, end));
                }
            }
            if outgoing.insert(from, to).is_some() {
                errors.push(format!("Node '{}' has more than one static edge", from));
            }
        }

        let branch_id = self.branch.as_ref().map(|(id, _)| id.as_str());
        let terminal_id = self.terminal.as_deref();

        if let Some((id, routes)) = &self.branch {
            if outgoing.contains_key(id.as_str()) {
                errors.push(format!("Branch node '{}' must not have a static edge", id));
            }
            for target in routes.targets() {
                if !known.contains(target.as_str()) {
                    errors.push(format!("Branch route targets unknown node '{}'", target));
                }
            }
        }

        if let Some(t) = terminal_id
            && outgoing.contains_key(t)
        {
            errors.push(format!("Terminal node '{}' must not have an outgoing edge", t));
        }

        for node in &self.nodes {
            let n = node.as_str();
            if Some(n) != branch_id && Some(n) != terminal_id && !outgoing.contains_key(n) {
                errors.push(format!("Node '{}' has no outgoing edge", n));
            }
        }

        // Every node must be able to reach the terminal.
        if let Some(t) = terminal_id {
            let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
            for (&from, &to) in &outgoing {
                reverse.entry(to).or_default().push(from);
            }
            if let Some((id, routes)) = &self.branch {
                for target in routes.targets() {
                    reverse.entry(target.as_str()).or_default().push(id.as_str());
                }
            }

            let mut reaches: HashSet<&str> = HashSet::from([t]);
            let mut queue = VecDeque::from([t]);
            while let Some(n) = queue.pop_front() {
                for &prev in reverse.get(n).into_iter().flatten() {
                    if reaches.insert(prev) {
                        queue.push_back(prev);
                    }
                }
            }

            for node in &self.nodes {
                if known.contains(t) && !reaches.contains(node.as_str()) {
                    errors.push(format!("Node '{}' cannot reach terminal '{}'", node, t));
                }
            }
        }

        errors
    }

    pub fn build(self) -> Result<GraphDefinition, EngineError> {
        let errors = self.validate();
        if !errors.is_empty() {
            return Err(EngineError::Graph(errors.join("; ")));
        }

        // validate() guarantees the three roles are present.
        let (Some(entry), Some(terminal), Some((branch, routes))) =
            (self.entry, self.terminal, self.branch)
        else {
            return Err(EngineError::Graph("incomplete graph".to_string()));
        };

        Ok(GraphDefinition {
            nodes: self.nodes,
            entry,
            branch,
            terminal,
            edges: self.edges.into_iter().collect(),
            routes,
        })
    }
}

/// The campaign workflow.
///
/// ```text
/// load_context -> analyze_files -> router
/// router -> discovery | reflection | insight | campaign_setup | adjustment | save
/// discovery -> data_collection -> insight -> campaign_setup -> save
/// reflection -> adjustment -> save
/// ```
pub fn campaign_graph() -> GraphDefinition {
    use ids::*;

    let routes = BranchRoutes {
        initialize: DISCOVERY.to_string(),
        reflect: REFLECTION.to_string(),
        enrich: DISCOVERY.to_string(),
        continue_by_phase: BTreeMap::from([
            (phase::INITIALIZED.to_string(), INSIGHT.to_string()),
            (phase::STRATEGY_BUILT.to_string(), CAMPAIGN_SETUP.to_string()),
            (phase::AWAITING_RESULTS.to_string(), SAVE.to_string()),
            (phase::OPTIMIZING.to_string(), ADJUSTMENT.to_string()),
        ]),
        fallback: DISCOVERY.to_string(),
    };

    GraphDefinition {
        nodes: [
            LOAD_CONTEXT,
            ANALYZE_FILES,
            ROUTER,
            DISCOVERY,
            DATA_COLLECTION,
            INSIGHT,
            CAMPAIGN_SETUP,
            REFLECTION,
            ADJUSTMENT,
            SAVE,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
        entry: LOAD_CONTEXT.to_string(),
        branch: ROUTER.to_string(),
        terminal: SAVE.to_string(),
        edges: [
            (LOAD_CONTEXT, ANALYZE_FILES),
            (ANALYZE_FILES, ROUTER),
            (DISCOVERY, DATA_COLLECTION),
            (DATA_COLLECTION, INSIGHT),
            (INSIGHT, CAMPAIGN_SETUP),
            (CAMPAIGN_SETUP, SAVE),
            (REFLECTION, ADJUSTMENT),
            (ADJUSTMENT, SAVE),
        ]
        .iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect(),
        routes,
    }
}
