//! ABOUTME: Executor registry mapping step tags to constructors
//! ABOUTME: In-process, populated at startup; new variants need an IR variant plus an entry

use crate::executor::StepExecutor;
use crate::executors::condition::ConditionExecutor;
use crate::executors::construct::ConstructExecutor;
use crate::executors::decoder::DecoderExecutor;
use crate::executors::echo::EchoExecutor;
use crate::executors::embedder::DocumentEmbedderExecutor;
use crate::executors::extractor::FieldExtractorExecutor;
use crate::executors::fanout::{AggregateExecutor, CollectExecutor, ExplodeExecutor};
use crate::executors::index_ops::{
    DocumentSearchExecutor, IndexUpsertExecutor, VectorSearchExecutor,
};
use crate::executors::inference::InferenceExecutor;
use crate::executors::invoke_flow::InvokeFlowExecutor;
use crate::executors::reranker::RerankerExecutor;
use crate::executors::source::{DocumentSourceExecutor, FileSourceExecutor, SqlSourceExecutor};
use crate::executors::splitter::DocumentSplitterExecutor;
use crate::executors::template::PromptTemplateExecutor;
use crate::executors::tool::InvokeToolExecutor;
use qtype_core::{QTypeError, Result};
use qtype_semantics::{FlowIr, StepIr, StepKindIr};
use std::collections::HashMap;
use std::sync::Arc;

/// Constructor for one step variant.
pub type BuilderFn = fn(&ExecutorFactory, &Arc<StepIr>) -> Result<Arc<dyn StepExecutor>>;

/// Registry from step discriminator tag to executor constructor.
pub struct ExecutorFactory {
    builders: HashMap<&'static str, BuilderFn>,
}

impl ExecutorFactory {
    /// The standard registry covering every built-in step variant.
    #[must_use]
    pub fn standard() -> Self {
        let mut factory = Self {
            builders: HashMap::new(),
        };
        factory.register("LLMInference", build_inference);
        factory.register("Agent", build_inference);
        factory.register("PromptTemplate", build_template);
        factory.register("InvokeTool", build_invoke_tool);
        factory.register("InvokeFlow", build_invoke_flow);
        factory.register("Condition", build_condition);
        factory.register("FileSource", build_file_source);
        factory.register("SQLSource", build_sql_source);
        factory.register("DocumentSource", build_document_source);
        factory.register("DocumentSplitter", build_splitter);
        factory.register("DocumentEmbedder", build_embedder);
        factory.register("VectorSearch", build_vector_search);
        factory.register("DocumentSearch", build_document_search);
        factory.register("IndexUpsert", build_index_upsert);
        factory.register("Reranker", build_reranker);
        factory.register("Aggregate", build_aggregate);
        factory.register("Explode", build_explode);
        factory.register("Collect", build_collect);
        factory.register("FieldExtractor", build_extractor);
        factory.register("Construct", build_construct);
        factory.register("Decoder", build_decoder);
        factory.register("Echo", build_echo);
        factory
    }

    /// Register (or replace) a builder for a tag.
    pub fn register(&mut self, tag: &'static str, builder: BuilderFn) {
        self.builders.insert(tag, builder);
    }

    /// Build the executor for a step.
    pub fn build(&self, step: &Arc<StepIr>) -> Result<Arc<dyn StepExecutor>> {
        let tag = step.tag();
        let builder = self.builders.get(tag).ok_or_else(|| {
            QTypeError::fatal(format!("no executor registered for step type '{tag}'"))
        })?;
        builder(self, step)
    }

    /// Build the full executor chain of a flow, in topological order.
    pub fn build_chain(&self, flow: &FlowIr) -> Result<Vec<Arc<dyn StepExecutor>>> {
        flow.steps.iter().map(|step| self.build(step)).collect()
    }
}

fn build_inference(_factory: &ExecutorFactory, step: &Arc<StepIr>) -> Result<Arc<dyn StepExecutor>> {
    match &step.kind {
        StepKindIr::LlmInference {
            model,
            memory,
            system_message,
        } => Ok(Arc::new(InferenceExecutor::inference(
            Arc::clone(step),
            Arc::clone(model),
            memory.clone(),
            system_message.clone(),
        ))),
        StepKindIr::Agent {
            model,
            memory,
            system_message,
            tools,
            max_iterations,
        } => Ok(Arc::new(InferenceExecutor::agent(
            Arc::clone(step),
            Arc::clone(model),
            memory.clone(),
            system_message.clone(),
            tools.clone(),
            *max_iterations,
        ))),
        _ => Err(mismatch(step)),
    }
}

fn build_template(_factory: &ExecutorFactory, step: &Arc<StepIr>) -> Result<Arc<dyn StepExecutor>> {
    match &step.kind {
        StepKindIr::PromptTemplate { template } => Ok(Arc::new(PromptTemplateExecutor::new(
            Arc::clone(step),
            template.clone(),
        ))),
        _ => Err(mismatch(step)),
    }
}

fn build_invoke_tool(
    _factory: &ExecutorFactory,
    step: &Arc<StepIr>,
) -> Result<Arc<dyn StepExecutor>> {
    match &step.kind {
        StepKindIr::InvokeTool {
            tool,
            input_bindings,
            output_bindings,
        } => Ok(Arc::new(InvokeToolExecutor::new(
            Arc::clone(step),
            Arc::clone(tool),
            input_bindings.clone(),
            output_bindings.clone(),
        ))),
        _ => Err(mismatch(step)),
    }
}

fn build_invoke_flow(factory: &ExecutorFactory, step: &Arc<StepIr>) -> Result<Arc<dyn StepExecutor>> {
    match &step.kind {
        StepKindIr::InvokeFlow {
            flow,
            input_bindings,
            output_bindings,
        } => {
            let chain = factory.build_chain(flow)?;
            Ok(Arc::new(InvokeFlowExecutor::new(
                Arc::clone(step),
                Arc::clone(flow),
                chain,
                input_bindings.clone(),
                output_bindings.clone(),
            )))
        }
        _ => Err(mismatch(step)),
    }
}

fn build_condition(factory: &ExecutorFactory, step: &Arc<StepIr>) -> Result<Arc<dyn StepExecutor>> {
    match &step.kind {
        StepKindIr::Condition {
            equals,
            then,
            otherwise,
        } => {
            let then_branch = factory.build(then)?;
            let else_branch = match otherwise {
                Some(branch) => Some(factory.build(branch)?),
                None => None,
            };
            Ok(Arc::new(ConditionExecutor::new(
                Arc::clone(step),
                Arc::clone(equals),
                then_branch,
                else_branch,
            )))
        }
        _ => Err(mismatch(step)),
    }
}

fn build_file_source(_factory: &ExecutorFactory, step: &Arc<StepIr>) -> Result<Arc<dyn StepExecutor>> {
    match &step.kind {
        StepKindIr::FileSource { path } => Ok(Arc::new(FileSourceExecutor::new(
            Arc::clone(step),
            path.clone(),
        ))),
        _ => Err(mismatch(step)),
    }
}

fn build_sql_source(_factory: &ExecutorFactory, step: &Arc<StepIr>) -> Result<Arc<dyn StepExecutor>> {
    match &step.kind {
        StepKindIr::SqlSource {
            connection, query, ..
        } => Ok(Arc::new(SqlSourceExecutor::new(
            Arc::clone(step),
            connection.clone(),
            query.clone(),
        ))),
        _ => Err(mismatch(step)),
    }
}

fn build_document_source(
    _factory: &ExecutorFactory,
    step: &Arc<StepIr>,
) -> Result<Arc<dyn StepExecutor>> {
    match &step.kind {
        StepKindIr::DocumentSource {
            reader_module,
            args,
            ..
        } => Ok(Arc::new(DocumentSourceExecutor::new(
            Arc::clone(step),
            reader_module.clone(),
            args.clone(),
        ))),
        _ => Err(mismatch(step)),
    }
}

fn build_splitter(_factory: &ExecutorFactory, step: &Arc<StepIr>) -> Result<Arc<dyn StepExecutor>> {
    match &step.kind {
        StepKindIr::DocumentSplitter {
            chunk_size,
            chunk_overlap,
            ..
        } => Ok(Arc::new(DocumentSplitterExecutor::new(
            Arc::clone(step),
            *chunk_size,
            *chunk_overlap,
        ))),
        _ => Err(mismatch(step)),
    }
}

fn build_embedder(_factory: &ExecutorFactory, step: &Arc<StepIr>) -> Result<Arc<dyn StepExecutor>> {
    match &step.kind {
        StepKindIr::DocumentEmbedder { model } => Ok(Arc::new(DocumentEmbedderExecutor::new(
            Arc::clone(step),
            Arc::clone(model),
        ))),
        _ => Err(mismatch(step)),
    }
}

fn build_vector_search(
    _factory: &ExecutorFactory,
    step: &Arc<StepIr>,
) -> Result<Arc<dyn StepExecutor>> {
    match &step.kind {
        StepKindIr::VectorSearch {
            index,
            top_k,
            score_threshold,
        } => Ok(Arc::new(VectorSearchExecutor::new(
            Arc::clone(step),
            Arc::clone(index),
            *top_k,
            *score_threshold,
        ))),
        _ => Err(mismatch(step)),
    }
}

fn build_document_search(
    _factory: &ExecutorFactory,
    step: &Arc<StepIr>,
) -> Result<Arc<dyn StepExecutor>> {
    match &step.kind {
        StepKindIr::DocumentSearch {
            index,
            max_results,
            search_fields,
            filters,
        } => Ok(Arc::new(DocumentSearchExecutor::new(
            Arc::clone(step),
            Arc::clone(index),
            *max_results,
            search_fields.clone(),
            filters.clone(),
        ))),
        _ => Err(mismatch(step)),
    }
}

fn build_index_upsert(
    _factory: &ExecutorFactory,
    step: &Arc<StepIr>,
) -> Result<Arc<dyn StepExecutor>> {
    match &step.kind {
        StepKindIr::IndexUpsert { index } => Ok(Arc::new(IndexUpsertExecutor::new(
            Arc::clone(step),
            Arc::clone(index),
        ))),
        _ => Err(mismatch(step)),
    }
}

fn build_reranker(_factory: &ExecutorFactory, step: &Arc<StepIr>) -> Result<Arc<dyn StepExecutor>> {
    match &step.kind {
        StepKindIr::Reranker { model, top_n } => Ok(Arc::new(RerankerExecutor::new(
            Arc::clone(step),
            Arc::clone(model),
            *top_n,
        ))),
        _ => Err(mismatch(step)),
    }
}

fn build_aggregate(_factory: &ExecutorFactory, step: &Arc<StepIr>) -> Result<Arc<dyn StepExecutor>> {
    match &step.kind {
        StepKindIr::Aggregate { reductions } => Ok(Arc::new(AggregateExecutor::new(
            Arc::clone(step),
            reductions.clone(),
        ))),
        _ => Err(mismatch(step)),
    }
}

fn build_explode(_factory: &ExecutorFactory, step: &Arc<StepIr>) -> Result<Arc<dyn StepExecutor>> {
    match &step.kind {
        StepKindIr::Explode => Ok(Arc::new(ExplodeExecutor::new(Arc::clone(step)))),
        _ => Err(mismatch(step)),
    }
}

fn build_collect(_factory: &ExecutorFactory, step: &Arc<StepIr>) -> Result<Arc<dyn StepExecutor>> {
    match &step.kind {
        StepKindIr::Collect => Ok(Arc::new(CollectExecutor::new(Arc::clone(step)))),
        _ => Err(mismatch(step)),
    }
}

fn build_extractor(_factory: &ExecutorFactory, step: &Arc<StepIr>) -> Result<Arc<dyn StepExecutor>> {
    match &step.kind {
        StepKindIr::FieldExtractor { path } => Ok(Arc::new(FieldExtractorExecutor::new(
            Arc::clone(step),
            path.clone(),
        ))),
        _ => Err(mismatch(step)),
    }
}

fn build_construct(_factory: &ExecutorFactory, step: &Arc<StepIr>) -> Result<Arc<dyn StepExecutor>> {
    match &step.kind {
        StepKindIr::Construct { ty, field_bindings } => Ok(Arc::new(ConstructExecutor::new(
            Arc::clone(step),
            Arc::clone(ty),
            field_bindings.clone(),
        ))),
        _ => Err(mismatch(step)),
    }
}

fn build_decoder(_factory: &ExecutorFactory, step: &Arc<StepIr>) -> Result<Arc<dyn StepExecutor>> {
    match &step.kind {
        StepKindIr::Decoder {
            format,
            schema,
            strict_mode,
            fallback,
            delimiter,
            has_headers,
            pattern,
        } => Ok(Arc::new(DecoderExecutor::build(
            Arc::clone(step),
            *format,
            schema.clone(),
            *strict_mode,
            fallback.clone(),
            *delimiter,
            *has_headers,
            pattern.clone(),
        )?)),
        _ => Err(mismatch(step)),
    }
}

fn build_echo(_factory: &ExecutorFactory, step: &Arc<StepIr>) -> Result<Arc<dyn StepExecutor>> {
    match &step.kind {
        StepKindIr::Echo { delay_ms } => Ok(Arc::new(EchoExecutor::new(Arc::clone(step), *delay_ms))),
        _ => Err(mismatch(step)),
    }
}

fn mismatch(step: &StepIr) -> QTypeError {
    QTypeError::fatal(format!(
        "executor builder received mismatched step kind for '{}'",
        step.id
    ))
}
