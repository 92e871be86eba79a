//! ABOUTME: Per-flow analysis: data-dependency graph, cardinality, and step obligations
//! ABOUTME: Builds FlowIr nodes while collecting diagnostics

use crate::checker::types::TypeTable;
use crate::ir::{
    CustomTypeIr, FlowIr, IndexIr, MemoryIr, ModelIr, StepIr, StepKindIr, StreamCardinality,
    ToolIr, VariableIr,
};
use crate::jsonpath::JsonPath;
use qtype_core::{codes, Diagnostic, PrimitiveKind, TypeRef};
use qtype_dsl::document::steps::{StepCardinality, StepDef};
use qtype_dsl::document::{FlowDef, FlowInterface, VariableDef};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, LazyLock};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_.\-]*)\}").expect("placeholder pattern"));

fn chat_message() -> TypeRef {
    TypeRef::Custom("ChatMessage".to_string())
}

fn rag_document() -> TypeRef {
    TypeRef::Custom("RAGDocument".to_string())
}

fn rag_chunk() -> TypeRef {
    TypeRef::Custom("RAGChunk".to_string())
}

fn search_results() -> TypeRef {
    TypeRef::list(TypeRef::Custom("RAGSearchResult".to_string()))
}

fn text() -> TypeRef {
    TypeRef::primitive(PrimitiveKind::Text)
}

/// Resolved entity tables shared across flow analysis.
pub(crate) struct EntityTables {
    pub models: BTreeMap<String, Arc<ModelIr>>,
    pub memories: BTreeMap<String, Arc<MemoryIr>>,
    pub auths: BTreeMap<String, Arc<qtype_dsl::document::AuthProviderDef>>,
    pub tools: BTreeMap<String, Arc<ToolIr>>,
    pub indexes: BTreeMap<String, Arc<IndexIr>>,
}

pub(crate) struct FlowAnalyzer<'a> {
    pub types: &'a TypeTable,
    pub entities: &'a EntityTables,
    /// Flows already built, in invocation dependency order.
    pub flows: &'a BTreeMap<String, Arc<FlowIr>>,
    pub diags: &'a mut Vec<Diagnostic>,
    pub warnings: &'a mut Vec<Diagnostic>,
}

impl FlowAnalyzer<'_> {
    /// Analyze one flow and build its IR. Diagnostics accumulate; the
    /// returned IR is only meaningful when no errors were recorded.
    pub fn analyze(&mut self, flow: &FlowDef) -> Option<FlowIr> {
        let variables = self.collect_variables(flow);

        let inputs = self.resolve_named(&flow.inputs, &variables, flow, "inputs");
        let outputs = self.resolve_named(&flow.outputs, &variables, flow, "outputs");
        let session_inputs =
            self.resolve_named(&flow.session_inputs, &variables, flow, "session_inputs");

        self.check_duplicate_steps(flow);

        // Node-level effective IO, condition branches folded into their node.
        let ios: Vec<(Vec<String>, Vec<String>)> =
            flow.steps.iter().map(|s| effective_io(s)).collect();

        for (step, (step_inputs, step_outputs)) in flow.steps.iter().zip(&ios) {
            for var in step_inputs.iter().chain(step_outputs) {
                if !variables.contains_key(var) {
                    self.diags.push(Diagnostic::new(
                        codes::VARIABLE_UNDECLARED,
                        format!(
                            "step '{}' in flow '{}' references undeclared variable '{}'",
                            step.id(),
                            flow.id,
                            var
                        ),
                    ));
                }
            }
        }

        let flow_inputs: BTreeSet<&str> = flow.inputs.iter().map(String::as_str).collect();
        let (order, edges) = self.dependency_order(flow, &ios, &flow_inputs)?;

        self.check_producibility(flow, &ios, &flow_inputs);

        // Effective stream cardinality per variable edge, walked in
        // execution order.
        let mut var_stream: HashMap<&str, StreamCardinality> = flow
            .inputs
            .iter()
            .map(|v| (v.as_str(), StreamCardinality::One))
            .collect();
        let mut input_streams = vec![StreamCardinality::One; flow.steps.len()];
        for &index in &order {
            let step = &flow.steps[index];
            let (step_inputs, step_outputs) = &ios[index];
            let incoming = if step_inputs.iter().any(|v| {
                var_stream.get(v.as_str()) == Some(&StreamCardinality::Many)
            }) {
                StreamCardinality::Many
            } else {
                StreamCardinality::One
            };
            input_streams[index] = incoming;
            let outgoing = match step.cardinality() {
                StepCardinality::Source | StepCardinality::OneToMany => StreamCardinality::Many,
                StepCardinality::ManyToOne => StreamCardinality::One,
                StepCardinality::OneToOne => incoming,
            };
            for output in step_outputs {
                var_stream.insert(output.as_str(), outgoing);
            }
        }

        // Build steps in execution order.
        let mut built: Vec<Option<Arc<StepIr>>> = vec![None; flow.steps.len()];
        for &index in &order {
            let step = &flow.steps[index];
            built[index] = self
                .build_step(step, &variables, input_streams[index])
                .map(Arc::new);
        }

        self.check_condition_coverage(flow, &ios, &edges);
        self.check_reachability(flow, &ios, &flow.outputs);
        self.check_dimensions(flow, &order, &edges);
        self.check_interface(flow, &inputs, &outputs);

        let steps: Vec<Arc<StepIr>> = order
            .iter()
            .filter_map(|&index| built[index].clone())
            .collect();
        if steps.len() != flow.steps.len() {
            return None;
        }

        let stateful = flow.interface == FlowInterface::Conversational
            && steps.iter().any(|step| {
                matches!(
                    &step.kind,
                    StepKindIr::LlmInference { memory: Some(_), .. }
                        | StepKindIr::Agent { memory: Some(_), .. }
                )
            });

        Some(FlowIr {
            id: flow.id.clone(),
            description: flow.description.clone(),
            interface: flow.interface,
            variables,
            inputs,
            outputs,
            session_inputs,
            steps,
            stateful,
        })
    }

    fn collect_variables(&mut self, flow: &FlowDef) -> BTreeMap<String, Arc<VariableIr>> {
        let mut variables = BTreeMap::new();
        for def in &flow.variables {
            self.types.check_known(
                &def.ty,
                &format!("flow '{}', variable '{}'", flow.id, def.id),
                self.diags,
            );
            let ir = Arc::new(variable_ir(def));
            if variables.insert(def.id.clone(), ir).is_some() {
                self.diags.push(Diagnostic::new(
                    codes::DUPLICATE_ID,
                    format!("variable '{}' is declared twice in flow '{}'", def.id, flow.id),
                ));
            }
        }
        variables
    }

    fn resolve_named(
        &mut self,
        names: &[String],
        variables: &BTreeMap<String, Arc<VariableIr>>,
        flow: &FlowDef,
        slot: &str,
    ) -> Vec<Arc<VariableIr>> {
        let mut resolved = Vec::with_capacity(names.len());
        for name in names {
            match variables.get(name) {
                Some(var) => resolved.push(Arc::clone(var)),
                None => self.diags.push(Diagnostic::new(
                    codes::VARIABLE_UNDECLARED,
                    format!("flow '{}' {slot} reference undeclared variable '{name}'", flow.id),
                )),
            }
        }
        resolved
    }

    fn check_duplicate_steps(&mut self, flow: &FlowDef) {
        let mut seen = HashSet::new();
        for step in &flow.steps {
            for id in step_ids(step) {
                if !seen.insert(id.clone()) {
                    self.diags.push(Diagnostic::new(
                        codes::DUPLICATE_ID,
                        format!("step id '{id}' appears twice in flow '{}'", flow.id),
                    ));
                }
            }
        }
    }

    /// Kahn's topological sort over producer → consumer edges.
    /// Returns execution order and the dependency edge list (consumer,
    /// producer), or `None` on a cycle.
    fn dependency_order(
        &mut self,
        flow: &FlowDef,
        ios: &[(Vec<String>, Vec<String>)],
        flow_inputs: &BTreeSet<&str>,
    ) -> Option<(Vec<usize>, Vec<(usize, usize)>)> {
        let mut producers: HashMap<&str, Vec<usize>> = HashMap::new();
        for (index, (_, outputs)) in ios.iter().enumerate() {
            for output in outputs {
                producers.entry(output.as_str()).or_default().push(index);
            }
        }

        let mut edges: Vec<(usize, usize)> = Vec::new();
        let mut depends_on: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); ios.len()];
        for (consumer, (inputs, _)) in ios.iter().enumerate() {
            for input in inputs {
                if flow_inputs.contains(input.as_str()) {
                    continue;
                }
                if let Some(sources) = producers.get(input.as_str()) {
                    for &producer in sources {
                        if producer != consumer {
                            depends_on[consumer].insert(producer);
                            edges.push((consumer, producer));
                        }
                    }
                }
            }
        }

        let mut in_degree: Vec<usize> = depends_on.iter().map(BTreeSet::len).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); ios.len()];
        for (consumer, deps) in depends_on.iter().enumerate() {
            for &producer in deps {
                dependents[producer].push(consumer);
            }
        }

        let mut queue: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &deg)| deg == 0)
            .map(|(index, _)| index)
            .collect();
        let mut order = Vec::with_capacity(ios.len());
        while let Some(index) = queue.pop_front() {
            order.push(index);
            for &dependent in &dependents[index] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if order.len() != ios.len() {
            let stuck: Vec<&str> = in_degree
                .iter()
                .enumerate()
                .filter(|(_, &deg)| deg > 0)
                .map(|(index, _)| flow.steps[index].id())
                .collect();
            self.diags.push(Diagnostic::new(
                codes::FLOW_CYCLIC,
                format!(
                    "flow '{}' has a cyclic step dependency involving: {}",
                    flow.id,
                    stuck.join(", ")
                ),
            ));
            return None;
        }
        Some((order, edges))
    }

    fn check_producibility(
        &mut self,
        flow: &FlowDef,
        ios: &[(Vec<String>, Vec<String>)],
        flow_inputs: &BTreeSet<&str>,
    ) {
        let mut produced: BTreeSet<&str> = BTreeSet::new();
        for (_, outputs) in ios {
            for output in outputs {
                produced.insert(output.as_str());
            }
        }
        for (index, (inputs, _)) in ios.iter().enumerate() {
            if flow.steps[index].cardinality() == StepCardinality::Source {
                continue;
            }
            for input in inputs {
                if !flow_inputs.contains(input.as_str()) && !produced.contains(input.as_str()) {
                    self.diags.push(Diagnostic::new(
                        codes::VARIABLE_UNPRODUCED,
                        format!(
                            "step '{}' in flow '{}' consumes '{}', which no step or flow input produces",
                            flow.steps[index].id(),
                            flow.id,
                            input
                        ),
                    ));
                }
            }
        }
    }

    // Warn when a one-armed condition's outputs are consumed downstream: the
    // missing branch leaves those consumers without a value.
    fn check_condition_coverage(
        &mut self,
        flow: &FlowDef,
        ios: &[(Vec<String>, Vec<String>)],
        _edges: &[(usize, usize)],
    ) {
        for (index, step) in flow.steps.iter().enumerate() {
            let StepDef::Condition(condition) = step else {
                continue;
            };
            if condition.otherwise.is_some() {
                continue;
            }
            let (_, outputs) = &ios[index];
            let consumed = ios.iter().enumerate().any(|(other, (inputs, _))| {
                other != index && inputs.iter().any(|input| outputs.contains(input))
            });
            if consumed {
                self.warnings.push(Diagnostic::warning(
                    codes::CONDITION_BRANCH_MISMATCH,
                    format!(
                        "condition '{}' in flow '{}' has no else branch but its outputs have consumers",
                        condition.common.id, flow.id
                    ),
                ));
            }
        }
    }

    // A step whose results can never reach a flow output (and that is not a
    // sink) is dead weight; non-fatal.
    fn check_reachability(
        &mut self,
        flow: &FlowDef,
        ios: &[(Vec<String>, Vec<String>)],
        flow_outputs: &[String],
    ) {
        let mut needed: BTreeSet<&str> = flow_outputs.iter().map(String::as_str).collect();
        let mut useful = vec![false; flow.steps.len()];
        // Iterate until fixpoint; flows are small.
        loop {
            let mut changed = false;
            for (index, (inputs, outputs)) in ios.iter().enumerate() {
                if useful[index] {
                    continue;
                }
                if flow.steps[index].is_sink() || outputs.iter().any(|o| needed.contains(o.as_str()))
                {
                    useful[index] = true;
                    for input in inputs {
                        changed |= needed.insert(input.as_str());
                    }
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        for (index, flag) in useful.iter().enumerate() {
            if !flag {
                self.warnings.push(Diagnostic::warning(
                    codes::STEP_UNREACHABLE,
                    format!(
                        "step '{}' in flow '{}' feeds no flow output or sink",
                        flow.steps[index].id(),
                        flow.id
                    ),
                ));
            }
        }
    }

    // Embedding dimensions along a path must agree with the vector index.
    fn check_dimensions(&mut self, flow: &FlowDef, order: &[usize], edges: &[(usize, usize)]) {
        let mut ancestors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); flow.steps.len()];
        for &index in order {
            let direct: Vec<usize> = edges
                .iter()
                .filter(|(consumer, _)| *consumer == index)
                .map(|(_, producer)| *producer)
                .collect();
            for producer in direct {
                ancestors[index].insert(producer);
                let inherited: Vec<usize> = ancestors[producer].iter().copied().collect();
                ancestors[index].extend(inherited);
            }
        }

        for (index, step) in flow.steps.iter().enumerate() {
            let index_id = match step {
                StepDef::VectorSearch(s) => s.index.id(),
                StepDef::IndexUpsert(s) => s.index.id(),
                _ => None,
            };
            let Some(index_id) = index_id else { continue };
            let Some(IndexIr::Vector {
                embedding_model, ..
            }) = self.entities.indexes.get(index_id).map(Arc::as_ref)
            else {
                continue;
            };
            let expected = embedding_model.dimensions;
            for &ancestor in &ancestors[index] {
                if let StepDef::DocumentEmbedder(embedder) = &flow.steps[ancestor] {
                    let model = embedder.model.id().and_then(|id| self.entities.models.get(id));
                    if let Some(model) = model {
                        if model.dimensions != expected {
                            self.diags.push(Diagnostic::new(
                                codes::DIMENSION_MISMATCH,
                                format!(
                                    "embedder '{}' produces {:?}-dimensional vectors but index '{}' expects {:?}",
                                    flow.steps[ancestor].id(),
                                    model.dimensions,
                                    index_id,
                                    expected
                                ),
                            ));
                        }
                    }
                }
            }
        }
    }

    fn check_interface(
        &mut self,
        flow: &FlowDef,
        inputs: &[Arc<VariableIr>],
        outputs: &[Arc<VariableIr>],
    ) {
        if flow.interface != FlowInterface::Conversational {
            if !flow.session_inputs.is_empty() {
                self.diags.push(Diagnostic::new(
                    codes::INTERFACE_CONSTRAINT,
                    format!("flow '{}' declares session_inputs but is not conversational", flow.id),
                ));
            }
            return;
        }

        let types = self.types;
        let is_chat = |var: &Arc<VariableIr>| types.compatible(&var.ty, &chat_message());
        if !inputs.iter().any(is_chat) {
            self.diags.push(Diagnostic::new(
                codes::INTERFACE_CONSTRAINT,
                format!(
                    "conversational flow '{}' requires at least one ChatMessage input",
                    flow.id
                ),
            ));
        }
        let chat_outputs = outputs.iter().filter(|v| is_chat(v)).count();
        if chat_outputs != 1 {
            self.diags.push(Diagnostic::new(
                codes::INTERFACE_CONSTRAINT,
                format!(
                    "conversational flow '{}' must declare exactly one ChatMessage output, found {chat_outputs}",
                    flow.id
                ),
            ));
        }
    }

    fn var<'v>(
        &mut self,
        id: &str,
        variables: &'v BTreeMap<String, Arc<VariableIr>>,
    ) -> Option<&'v Arc<VariableIr>> {
        variables.get(id)
    }

    fn resolve_vars(
        &mut self,
        names: &[String],
        variables: &BTreeMap<String, Arc<VariableIr>>,
    ) -> Vec<Arc<VariableIr>> {
        names
            .iter()
            .filter_map(|name| variables.get(name).cloned())
            .collect()
    }

    fn mismatch(&mut self, step_id: &str, detail: String) {
        self.diags.push(Diagnostic::new(
            codes::TYPE_MISMATCH,
            format!("step '{step_id}': {detail}"),
        ));
    }

    // Producer-side check: the step writes `produced` into `var`.
    fn check_writes(&mut self, step_id: &str, produced: &TypeRef, var: &Arc<VariableIr>) {
        if !self.types.compatible(produced, &var.ty) {
            self.mismatch(
                step_id,
                format!(
                    "writes {produced} into variable '{}' of type {}",
                    var.id, var.ty
                ),
            );
        }
    }

    // Consumer-side check: the step needs `expected` from `var`.
    fn check_reads(&mut self, step_id: &str, var: &Arc<VariableIr>, expected: &TypeRef) {
        if !self.types.compatible(&var.ty, expected) {
            self.mismatch(
                step_id,
                format!(
                    "reads variable '{}' of type {} where {expected} is required",
                    var.id, var.ty
                ),
            );
        }
    }

    #[allow(clippy::too_many_lines)]
    fn build_step(
        &mut self,
        step: &StepDef,
        variables: &BTreeMap<String, Arc<VariableIr>>,
        input_stream: StreamCardinality,
    ) -> Option<StepIr> {
        let common = step.common();
        let step_id = common.id.clone();
        let inputs = self.resolve_vars(&common.inputs, variables);
        let outputs = self.resolve_vars(&common.outputs, variables);

        let kind = match step {
            StepDef::LLMInference(inference) => {
                self.check_inference_io(&step_id, &outputs);
                StepKindIr::LlmInference {
                    model: self.model(inference.model.id()?)?,
                    memory: match &inference.memory {
                        Some(slot) => Some(self.memory(slot.id()?)?),
                        None => None,
                    },
                    system_message: inference.system_message.clone(),
                }
            }
            StepDef::Agent(agent) => {
                self.check_inference_io(&step_id, &outputs);
                let mut tools = Vec::with_capacity(agent.tools.len());
                for slot in &agent.tools {
                    tools.push(self.tool(slot.id()?)?);
                }
                StepKindIr::Agent {
                    model: self.model(agent.inference.model.id()?)?,
                    memory: match &agent.inference.memory {
                        Some(slot) => Some(self.memory(slot.id()?)?),
                        None => None,
                    },
                    system_message: agent.inference.system_message.clone(),
                    tools,
                    max_iterations: agent.max_iterations,
                }
            }
            StepDef::PromptTemplate(template) => {
                for capture in PLACEHOLDER.captures_iter(&template.template) {
                    let placeholder = &capture[1];
                    if !common.inputs.iter().any(|input| input == placeholder) {
                        self.diags.push(Diagnostic::new(
                            codes::TEMPLATE_PLACEHOLDER_UNBOUND,
                            format!(
                                "template '{step_id}' uses placeholder '{{{placeholder}}}' that is not among its inputs"
                            ),
                        ));
                    }
                }
                if let Some(output) = outputs.first() {
                    self.check_writes(&step_id, &text(), output);
                }
                StepKindIr::PromptTemplate {
                    template: template.template.clone(),
                }
            }
            StepDef::InvokeTool(invoke) => {
                let tool = self.tool(invoke.tool.id()?)?;
                self.check_bindings(
                    &step_id,
                    tool.inputs(),
                    tool.outputs(),
                    &invoke.input_bindings,
                    &invoke.output_bindings,
                    variables,
                );
                StepKindIr::InvokeTool {
                    tool,
                    input_bindings: invoke.input_bindings.clone(),
                    output_bindings: invoke.output_bindings.clone(),
                }
            }
            StepDef::InvokeFlow(invoke) => {
                let flow_id = invoke.flow.id()?;
                let Some(inner) = self.flows.get(flow_id).cloned() else {
                    self.diags.push(Diagnostic::new(
                        codes::REF_UNRESOLVED,
                        format!("step '{step_id}' invokes unknown flow '{flow_id}'"),
                    ));
                    return None;
                };
                self.check_flow_bindings(&step_id, &inner, invoke, variables);
                StepKindIr::InvokeFlow {
                    flow: inner,
                    input_bindings: invoke.input_bindings.clone(),
                    output_bindings: invoke.output_bindings.clone(),
                }
            }
            StepDef::Condition(condition) => {
                let equals = match self.var(&condition.equals, variables) {
                    Some(var) => Arc::clone(var),
                    None => {
                        self.diags.push(Diagnostic::new(
                            codes::VARIABLE_UNDECLARED,
                            format!(
                                "condition '{step_id}' compares against undeclared variable '{}'",
                                condition.equals
                            ),
                        ));
                        return None;
                    }
                };
                if let Some(input) = inputs.first() {
                    let forward = self.types.compatible(&input.ty, &equals.ty);
                    let backward = self.types.compatible(&equals.ty, &input.ty);
                    if !forward && !backward {
                        self.mismatch(
                            &step_id,
                            format!(
                                "cannot compare '{}' ({}) with '{}' ({})",
                                input.id, input.ty, equals.id, equals.ty
                            ),
                        );
                    }
                }
                let then = self.build_branch(&condition.then, variables, input_stream)?;
                let otherwise = match &condition.otherwise {
                    Some(branch) => {
                        let built = self.build_branch(branch, variables, input_stream)?;
                        self.check_branch_shapes(&step_id, &then, &built);
                        Some(built)
                    }
                    None => None,
                };
                StepKindIr::Condition {
                    equals,
                    then,
                    otherwise,
                }
            }
            StepDef::FileSource(source) => {
                for output in &outputs {
                    if !matches!(output.ty.required(), TypeRef::Primitive(_)) {
                        self.mismatch(
                            &step_id,
                            format!(
                                "file column '{}' must bind to a primitive variable, not {}",
                                output.id, output.ty
                            ),
                        );
                    }
                }
                StepKindIr::FileSource {
                    path: source.path.clone(),
                }
            }
            StepDef::SQLSource(source) => StepKindIr::SqlSource {
                connection: source.connection.clone(),
                query: source.query.clone(),
                auth: match &source.auth {
                    Some(slot) => self.auth_of(slot.id()?),
                    None => None,
                },
            },
            StepDef::DocumentSource(source) => {
                if let Some(output) = outputs.first() {
                    self.check_writes(&step_id, &rag_document(), output);
                }
                StepKindIr::DocumentSource {
                    reader_module: source.reader_module.clone(),
                    args: source.args.clone(),
                    loader_args: source.loader_args.clone(),
                }
            }
            StepDef::DocumentSplitter(splitter) => {
                if let Some(input) = inputs.first() {
                    self.check_reads(&step_id, input, &rag_document());
                }
                if let Some(output) = outputs.first() {
                    self.check_writes(&step_id, &rag_chunk(), output);
                }
                StepKindIr::DocumentSplitter {
                    splitter_name: splitter.splitter_name.clone(),
                    chunk_size: splitter.chunk_size,
                    chunk_overlap: splitter.chunk_overlap,
                }
            }
            StepDef::DocumentEmbedder(embedder) => {
                if let Some(input) = inputs.first() {
                    self.check_reads(&step_id, input, &rag_chunk());
                }
                if let Some(output) = outputs.first() {
                    self.check_writes(&step_id, &rag_chunk(), output);
                }
                let model = self.model(embedder.model.id()?)?;
                if model.dimensions.is_none() {
                    self.diags.push(Diagnostic::new(
                        codes::REF_KIND_MISMATCH,
                        format!("step '{step_id}' requires an EmbeddingModel"),
                    ));
                }
                StepKindIr::DocumentEmbedder { model }
            }
            StepDef::VectorSearch(search) => {
                if let Some(output) = outputs.first() {
                    self.check_writes(&step_id, &search_results(), output);
                }
                StepKindIr::VectorSearch {
                    index: self.vector_index(&step_id, search.index.id()?)?,
                    top_k: search.default_top_k,
                    score_threshold: search.score_threshold,
                }
            }
            StepDef::DocumentSearch(search) => {
                if let Some(input) = inputs.first() {
                    self.check_reads(&step_id, input, &text());
                }
                if let Some(output) = outputs.first() {
                    self.check_writes(&step_id, &search_results(), output);
                }
                StepKindIr::DocumentSearch {
                    index: self.index(search.index.id()?)?,
                    max_results: search.max_results,
                    search_fields: search.search_fields.clone(),
                    filters: search.filters.clone(),
                }
            }
            StepDef::IndexUpsert(upsert) => {
                if let Some(input) = inputs.first() {
                    self.check_reads(&step_id, input, &rag_chunk());
                }
                StepKindIr::IndexUpsert {
                    index: self.index(upsert.index.id()?)?,
                }
            }
            StepDef::Reranker(reranker) => {
                if let Some(input) = inputs.first() {
                    self.check_reads(&step_id, input, &search_results());
                }
                if let Some(output) = outputs.first() {
                    self.check_writes(&step_id, &search_results(), output);
                }
                StepKindIr::Reranker {
                    model: self.model(reranker.model.id()?)?,
                    top_n: reranker.top_n,
                }
            }
            StepDef::Aggregate(aggregate) => {
                if let Some(output) = outputs.first() {
                    self.check_writes(
                        &step_id,
                        &TypeRef::Custom("AggregateStats".to_string()),
                        output,
                    );
                }
                for (target, reduction) in &aggregate.reductions {
                    if !variables.contains_key(target) {
                        self.diags.push(Diagnostic::new(
                            codes::VARIABLE_UNDECLARED,
                            format!("aggregate '{step_id}' reduces into undeclared variable '{target}'"),
                        ));
                    }
                    if !common.inputs.contains(&reduction.over) {
                        self.mismatch(
                            &step_id,
                            format!("reduction reads '{}', which is not an input", reduction.over),
                        );
                    }
                }
                StepKindIr::Aggregate {
                    reductions: aggregate.reductions.clone(),
                }
            }
            StepDef::Explode(_) => {
                match (inputs.first(), outputs.first()) {
                    (Some(input), Some(output)) => {
                        match element_of(self.types, &input.ty) {
                            Some(element) => self.check_writes(&step_id, &element, output),
                            None => self.mismatch(
                                &step_id,
                                format!("explode input '{}' must be a list, got {}", input.id, input.ty),
                            ),
                        }
                    }
                    _ => self.mismatch(&step_id, "explode needs one input and one output".to_string()),
                }
                StepKindIr::Explode
            }
            StepDef::Collect(_) => {
                match (inputs.first(), outputs.first()) {
                    (Some(input), Some(output)) => {
                        self.check_writes(&step_id, &TypeRef::list(input.ty.clone()), output);
                    }
                    _ => self.mismatch(&step_id, "collect needs one input and one output".to_string()),
                }
                StepKindIr::Collect
            }
            StepDef::FieldExtractor(extractor) => {
                let path = match JsonPath::parse(&extractor.json_path) {
                    Ok(path) => path,
                    Err(err) => {
                        self.diags.push(Diagnostic::new(
                            codes::FIELD_INVALID,
                            format!("step '{step_id}': {err}"),
                        ));
                        return None;
                    }
                };
                StepKindIr::FieldExtractor { path }
            }
            StepDef::Construct(construct) => {
                let Some(ty) = self.types.get(&construct.custom_type).cloned() else {
                    self.diags.push(Diagnostic::new(
                        codes::TYPE_UNKNOWN,
                        format!(
                            "step '{step_id}' constructs unknown type '{}'",
                            construct.custom_type
                        ),
                    ));
                    return None;
                };
                if let CustomTypeIr::Object { fields, .. } = ty.as_ref() {
                    for (field, field_ty) in fields {
                        if field_ty.is_optional() {
                            continue;
                        }
                        let source = construct
                            .field_bindings
                            .get(field)
                            .map_or(field.as_str(), String::as_str);
                        match self.var(source, variables) {
                            Some(var) => {
                                let var = Arc::clone(var);
                                self.check_reads(&step_id, &var, field_ty);
                            }
                            None => self.diags.push(Diagnostic::new(
                                codes::CONSTRUCT_ERROR,
                                format!(
                                    "step '{step_id}' has no input for required field '{field}' of '{}'",
                                    construct.custom_type
                                ),
                            )),
                        }
                    }
                }
                if let Some(output) = outputs.first() {
                    self.check_writes(
                        &step_id,
                        &TypeRef::Custom(construct.custom_type.clone()),
                        output,
                    );
                }
                StepKindIr::Construct {
                    ty,
                    field_bindings: construct.field_bindings.clone(),
                }
            }
            StepDef::Decoder(decoder) => {
                if let Some(input) = inputs.first() {
                    self.check_reads(&step_id, input, &text());
                }
                StepKindIr::Decoder {
                    format: decoder.format,
                    schema: decoder.schema.clone(),
                    strict_mode: decoder.strict_mode,
                    fallback: decoder.fallback.clone(),
                    delimiter: decoder.delimiter,
                    has_headers: decoder.has_headers,
                    pattern: decoder.pattern.clone(),
                }
            }
            StepDef::Echo(echo) => {
                // Forwards positionally: input i lands in output i.
                if common.outputs.len() > common.inputs.len() {
                    self.mismatch(
                        &step_id,
                        format!(
                            "echo declares {} outputs but only {} inputs",
                            common.outputs.len(),
                            common.inputs.len()
                        ),
                    );
                }
                let pairs: Vec<_> = inputs
                    .iter()
                    .zip(outputs.iter())
                    .map(|(input, output)| (Arc::clone(input), Arc::clone(output)))
                    .collect();
                for (input, output) in pairs {
                    self.check_writes(&step_id, &input.ty, &output);
                }
                StepKindIr::Echo {
                    delay_ms: echo.delay_ms,
                }
            }
        };

        Some(StepIr {
            id: step_id,
            kind,
            inputs,
            outputs,
            cardinality: step.cardinality(),
            input_stream,
            concurrency: common.concurrency,
            batch_size: common.batch_size,
        })
    }

    // Branch steps run per message; fan-out or fan-in inside a branch has no
    // defined cardinality and is rejected.
    fn build_branch(
        &mut self,
        branch: &StepDef,
        variables: &BTreeMap<String, Arc<VariableIr>>,
        input_stream: StreamCardinality,
    ) -> Option<Arc<StepIr>> {
        if branch.cardinality() != StepCardinality::OneToOne {
            self.diags.push(Diagnostic::new(
                codes::CONDITION_BRANCH_MISMATCH,
                format!(
                    "condition branch '{}' must be a one-to-one step, got {}",
                    branch.id(),
                    branch.tag()
                ),
            ));
            return None;
        }
        self.build_step(branch, variables, input_stream).map(Arc::new)
    }

    fn check_branch_shapes(&mut self, step_id: &str, then: &Arc<StepIr>, otherwise: &Arc<StepIr>) {
        let then_ids: BTreeSet<&str> = then.outputs.iter().map(|v| v.id.as_str()).collect();
        let else_ids: BTreeSet<&str> = otherwise.outputs.iter().map(|v| v.id.as_str()).collect();
        if then_ids != else_ids {
            self.diags.push(Diagnostic::new(
                codes::CONDITION_BRANCH_MISMATCH,
                format!(
                    "condition '{step_id}' branches produce different outputs ({then_ids:?} vs {else_ids:?})"
                ),
            ));
        }
    }

    fn check_inference_io(&mut self, step_id: &str, outputs: &[Arc<VariableIr>]) {
        if outputs.len() != 1 {
            self.mismatch(
                step_id,
                format!("inference steps declare exactly one output, found {}", outputs.len()),
            );
            return;
        }
        let output = &outputs[0];
        let text_ok = self.types.compatible(&text(), &output.ty);
        let chat_ok = self.types.compatible(&chat_message(), &output.ty);
        if !text_ok && !chat_ok {
            let output = Arc::clone(output);
            self.mismatch(
                step_id,
                format!(
                    "inference output '{}' must accept text or ChatMessage, got {}",
                    output.id, output.ty
                ),
            );
        }
    }

    fn check_bindings(
        &mut self,
        step_id: &str,
        tool_inputs: &indexmap::IndexMap<String, TypeRef>,
        tool_outputs: &indexmap::IndexMap<String, TypeRef>,
        input_bindings: &BTreeMap<String, String>,
        output_bindings: &BTreeMap<String, String>,
        variables: &BTreeMap<String, Arc<VariableIr>>,
    ) {
        for (param, param_ty) in tool_inputs {
            let Some(var_id) = input_bindings.get(param) else {
                if !param_ty.is_optional() {
                    self.mismatch(step_id, format!("tool parameter '{param}' is not bound"));
                }
                continue;
            };
            match variables.get(var_id) {
                Some(var) => {
                    let var = Arc::clone(var);
                    self.check_reads(step_id, &var, param_ty);
                }
                None => self.diags.push(Diagnostic::new(
                    codes::VARIABLE_UNDECLARED,
                    format!("step '{step_id}' binds '{param}' to undeclared variable '{var_id}'"),
                )),
            }
        }
        for param in input_bindings.keys() {
            if !tool_inputs.contains_key(param) {
                self.mismatch(step_id, format!("unknown tool parameter '{param}'"));
            }
        }
        for (param, var_id) in output_bindings {
            let Some(param_ty) = tool_outputs.get(param) else {
                self.mismatch(step_id, format!("unknown tool output '{param}'"));
                continue;
            };
            match variables.get(var_id) {
                Some(var) => {
                    let var = Arc::clone(var);
                    self.check_writes(step_id, param_ty, &var);
                }
                None => self.diags.push(Diagnostic::new(
                    codes::VARIABLE_UNDECLARED,
                    format!("step '{step_id}' binds output '{param}' to undeclared variable '{var_id}'"),
                )),
            }
        }
    }

    fn check_flow_bindings(
        &mut self,
        step_id: &str,
        inner: &Arc<FlowIr>,
        invoke: &qtype_dsl::document::steps::InvokeFlowStep,
        variables: &BTreeMap<String, Arc<VariableIr>>,
    ) {
        for input in &inner.inputs {
            let Some(var_id) = invoke.input_bindings.get(&input.id) else {
                if !input.ty.is_optional() {
                    self.mismatch(
                        step_id,
                        format!("inner flow input '{}' is not bound", input.id),
                    );
                }
                continue;
            };
            match variables.get(var_id) {
                Some(var) => {
                    let var = Arc::clone(var);
                    self.check_reads(step_id, &var, &input.ty);
                }
                None => self.diags.push(Diagnostic::new(
                    codes::VARIABLE_UNDECLARED,
                    format!("step '{step_id}' binds '{}' to undeclared variable '{var_id}'", input.id),
                )),
            }
        }
        for (inner_output, var_id) in &invoke.output_bindings {
            let Some(output) = inner.outputs.iter().find(|v| &v.id == inner_output) else {
                self.mismatch(step_id, format!("unknown inner flow output '{inner_output}'"));
                continue;
            };
            match variables.get(var_id) {
                Some(var) => {
                    let produced = output.ty.clone();
                    let var = Arc::clone(var);
                    self.check_writes(step_id, &produced, &var);
                }
                None => self.diags.push(Diagnostic::new(
                    codes::VARIABLE_UNDECLARED,
                    format!("step '{step_id}' binds output '{inner_output}' to undeclared variable '{var_id}'"),
                )),
            }
        }
    }

    fn model(&mut self, id: &str) -> Option<Arc<ModelIr>> {
        let found = self.entities.models.get(id).cloned();
        if found.is_none() {
            self.diags.push(Diagnostic::new(
                codes::REF_UNRESOLVED,
                format!("model '{id}' is not defined"),
            ));
        }
        found
    }

    fn memory(&mut self, id: &str) -> Option<Arc<MemoryIr>> {
        let found = self.entities.memories.get(id).cloned();
        if found.is_none() {
            self.diags.push(Diagnostic::new(
                codes::REF_UNRESOLVED,
                format!("memory '{id}' is not defined"),
            ));
        }
        found
    }

    fn tool(&mut self, id: &str) -> Option<Arc<ToolIr>> {
        let found = self.entities.tools.get(id).cloned();
        if found.is_none() {
            self.diags.push(Diagnostic::new(
                codes::REF_UNRESOLVED,
                format!("tool '{id}' is not defined"),
            ));
        }
        found
    }

    fn index(&mut self, id: &str) -> Option<Arc<IndexIr>> {
        let found = self.entities.indexes.get(id).cloned();
        if found.is_none() {
            self.diags.push(Diagnostic::new(
                codes::REF_UNRESOLVED,
                format!("index '{id}' is not defined"),
            ));
        }
        found
    }

    fn vector_index(&mut self, step_id: &str, id: &str) -> Option<Arc<IndexIr>> {
        let index = self.index(id)?;
        if matches!(index.as_ref(), IndexIr::Document { .. }) {
            self.diags.push(Diagnostic::new(
                codes::REF_KIND_MISMATCH,
                format!("step '{step_id}' requires a vector index, '{id}' is a document index"),
            ));
        }
        Some(index)
    }

    fn auth_of(&mut self, id: &str) -> Option<Arc<qtype_dsl::document::AuthProviderDef>> {
        self.entities.auths.get(id).cloned()
    }
}

fn variable_ir(def: &VariableDef) -> VariableIr {
    VariableIr {
        id: def.id.clone(),
        ty: def.effective_type(),
        ui_hint: def.ui_hint.clone(),
    }
}

/// Element type of a list-like type, resolving array customs.
fn element_of(types: &TypeTable, ty: &TypeRef) -> Option<TypeRef> {
    match ty {
        TypeRef::List(inner) => Some((**inner).clone()),
        TypeRef::Custom(name) => match types.get(name).map(Arc::as_ref) {
            Some(CustomTypeIr::Array { element, .. }) => Some(element.clone()),
            _ => None,
        },
        TypeRef::Optional(inner) => element_of(types, inner),
        TypeRef::Primitive(_) => None,
    }
}

/// All step ids a definition contributes, including condition branches.
fn step_ids(step: &StepDef) -> Vec<String> {
    let mut ids = vec![step.id().to_string()];
    if let StepDef::Condition(condition) = step {
        ids.extend(step_ids(&condition.then));
        if let Some(otherwise) = &condition.otherwise {
            ids.extend(step_ids(otherwise));
        }
    }
    ids
}

/// Effective node-level IO: declared IO plus binding targets, with condition
/// branches folded into their owning node.
pub(crate) fn effective_io(step: &StepDef) -> (Vec<String>, Vec<String>) {
    let common = step.common();
    let mut inputs: Vec<String> = common.inputs.clone();
    let mut outputs: Vec<String> = common.outputs.clone();

    match step {
        StepDef::Aggregate(aggregate) => {
            outputs.extend(aggregate.reductions.keys().cloned());
        }
        StepDef::InvokeTool(invoke) => {
            inputs.extend(invoke.input_bindings.values().cloned());
            outputs.extend(invoke.output_bindings.values().cloned());
        }
        StepDef::InvokeFlow(invoke) => {
            inputs.extend(invoke.input_bindings.values().cloned());
            outputs.extend(invoke.output_bindings.values().cloned());
        }
        StepDef::Condition(condition) => {
            inputs.push(condition.equals.clone());
            let (then_in, then_out) = effective_io(&condition.then);
            inputs.extend(then_in);
            outputs.extend(then_out);
            if let Some(otherwise) = &condition.otherwise {
                let (else_in, else_out) = effective_io(otherwise);
                inputs.extend(else_in);
                outputs.extend(else_out);
            }
        }
        _ => {}
    }

    dedup(&mut inputs);
    dedup(&mut outputs);
    (inputs, outputs)
}

fn dedup(items: &mut Vec<String>) {
    let mut seen = HashSet::new();
    items.retain(|item| seen.insert(item.clone()));
}
