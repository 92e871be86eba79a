//! End-to-end interpreter scenarios over compiled documents with stub
//! providers: completion, templating, batch aggregation, conversational
//! memory, RAG ingestion and query, and cancellation.

mod support;

use qtype_core::traits::model::CompletionOutcome;
use qtype_core::types::chat::ChatMessage;
use qtype_core::Value;
use qtype_runtime::{FlowRunner, RunnerDeps, RuntimeOptions, StreamEvent};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use support::{compile, StubProviders};

fn runner(ir: Arc<qtype_semantics::SemanticIr>, flow: &str, providers: StubProviders) -> FlowRunner {
    FlowRunner::new(ir, flow, RunnerDeps::new(Arc::new(providers))).expect("runner")
}

#[tokio::test]
async fn hello_world_complete_flow() {
    let ir = compile(
        r"
id: hello
models:
  - type: Model
    id: gpt4
    provider: openai
flows:
  - id: main
    variables:
      - id: question
        type: text
    inputs: [question]
    outputs: [ask.response]
    steps:
      - type: LLMInference
        id: ask
        model: gpt4
        system_message: You are a helpful assistant.
        inputs: [question]
",
    );
    let runner = runner(ir, "main", StubProviders::fixed("2 + 2 = 4"));
    let mut events = runner.events();

    let results = runner
        .run(BTreeMap::from([(
            "question".to_string(),
            Value::from("What is 2+2?"),
        )]))
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    let response = results[0].get("ask.response").unwrap().render();
    assert!(response.contains('4'), "got: {response}");

    // Event order within the step: start → text-start → deltas → finish.
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    let kinds: Vec<&str> = seen
        .iter()
        .map(|event| match event {
            StreamEvent::StartStep { .. } => "start-step",
            StreamEvent::TextStart { .. } => "text-start",
            StreamEvent::TextDelta { .. } => "text-delta",
            StreamEvent::FinishStep { .. } => "finish-step",
            StreamEvent::Finish => "finish",
            _ => "other",
        })
        .collect();
    let start = kinds.iter().position(|k| *k == "start-step").unwrap();
    let text_start = kinds.iter().position(|k| *k == "text-start").unwrap();
    let first_delta = kinds.iter().position(|k| *k == "text-delta").unwrap();
    let finish_step = kinds.iter().position(|k| *k == "finish-step").unwrap();
    assert!(start < text_start && text_start < first_delta && first_delta < finish_step);
    assert_eq!(kinds.iter().filter(|k| **k == "text-start").count(), 1);
}

#[tokio::test]
async fn template_feeds_inference() {
    let ir = compile(
        r"
id: translate
models:
  - type: Model
    id: gpt4
    provider: openai
flows:
  - id: main
    variables:
      - id: text
        type: text
      - id: lang
        type: text
    inputs: [text, lang]
    outputs: [ask.response]
    steps:
      - type: PromptTemplate
        id: make_prompt
        template: Translate '{text}' to {lang}
        inputs: [text, lang]
      - type: LLMInference
        id: ask
        model: gpt4
        inputs: [make_prompt.prompt]
",
    );
    let runner = runner(ir, "main", StubProviders::fixed("bonjour"));
    let results = runner
        .run(BTreeMap::from([
            ("text".to_string(), Value::from("hello")),
            ("lang".to_string(), Value::from("French")),
        ]))
        .await
        .unwrap();

    assert_eq!(
        results[0].get("make_prompt.prompt").unwrap().render(),
        "Translate 'hello' to French"
    );
    assert_eq!(results[0].get("ask.response").unwrap().render(), "bonjour");
}

#[tokio::test]
async fn file_source_feeds_aggregate() {
    let dir = tempfile::TempDir::new().unwrap();
    let csv_path = dir.path().join("customers.csv");
    std::fs::write(
        &csv_path,
        "name,region,purchases\nada,eu,3\nbob,us,1\ncho,ap,7\ndee,eu,2\neli,us,5\n",
    )
    .unwrap();

    let ir = compile(&format!(
        r"
id: batch
flows:
  - id: main
    variables:
      - id: name
        type: text
      - id: region
        type: text
      - id: purchases
        type: int
      - id: total
        type: float
    outputs: [agg.stats, total]
    steps:
      - type: FileSource
        id: rows
        path: {}
        outputs: [name, region, purchases]
      - type: Aggregate
        id: agg
        inputs: [purchases]
        reductions:
          total:
            op: sum
            over: purchases
",
        csv_path.display()
    ));
    let runner = runner(ir, "main", StubProviders::fixed("unused"));
    let results = runner.run(BTreeMap::new()).await.unwrap();

    assert_eq!(results.len(), 1);
    let stats = results[0].get("agg.stats").unwrap().to_json();
    assert_eq!(stats["num_successful"], 5);
    assert_eq!(stats["num_failed"], 0);
    assert_eq!(stats["num_total"], 5);
    assert_eq!(results[0].get("total").unwrap().to_json(), 18.0);
}

#[tokio::test]
async fn aggregate_over_empty_stream_emits_one_message() {
    let dir = tempfile::TempDir::new().unwrap();
    let csv_path = dir.path().join("empty.csv");
    std::fs::write(&csv_path, "name\n").unwrap();

    let ir = compile(&format!(
        r"
id: empty_batch
flows:
  - id: main
    variables:
      - id: name
        type: text
    outputs: [agg.stats]
    steps:
      - type: FileSource
        id: rows
        path: {}
        outputs: [name]
      - type: Aggregate
        id: agg
        inputs: [name]
",
        csv_path.display()
    ));
    let runner = runner(ir, "main", StubProviders::fixed("unused"));
    let results = runner.run(BTreeMap::new()).await.unwrap();

    assert_eq!(results.len(), 1);
    let stats = results[0].get("agg.stats").unwrap().to_json();
    assert_eq!(stats["num_total"], 0);
    assert_eq!(stats["num_successful"], 0);
}

#[tokio::test]
async fn conversational_memory_round_trip() {
    let ir = compile(
        r"
id: chat
models:
  - type: Model
    id: gpt4
    provider: openai
memories:
  - id: chat_memory
    token_limit: 50000
flows:
  - id: main
    interface: conversational
    variables:
      - id: chat_in
        type: ChatMessage
      - id: reply
        type: ChatMessage
    inputs: [chat_in]
    outputs: [reply]
    steps:
      - type: LLMInference
        id: ask
        model: gpt4
        memory: chat_memory
        inputs: [chat_in]
        outputs: [reply]
",
    );

    // The stub remembers the last stated name from the visible history.
    let responder: support::Responder = Arc::new(|request| {
        let mut name: Option<String> = None;
        let mut asked = false;
        for message in &request.messages {
            let text = message.text();
            if let Some(rest) = text.strip_prefix("My name is ") {
                name = Some(rest.trim_end_matches('.').to_string());
            }
            if text.contains("What's my name") {
                asked = true;
            }
        }
        let reply = if asked {
            match name {
                Some(name) => format!("Your name is {name}."),
                None => "I don't know your name.".to_string(),
            }
        } else {
            "Nice to meet you!".to_string()
        };
        CompletionOutcome {
            message: ChatMessage::assistant(reply),
            tool_calls: Vec::new(),
        }
    });
    let runner = runner(ir, "main", StubProviders::new(responder));

    let turn = |text: &str| {
        BTreeMap::from([(
            "chat_in".to_string(),
            Value::from_serialize(&ChatMessage::user(text)),
        )])
    };

    let first = runner
        .run_session("session-alice", turn("My name is Alice."))
        .await
        .unwrap();
    assert!(!first[0].is_failed());

    let second = runner
        .run_session("session-alice", turn("What's my name?"))
        .await
        .unwrap();
    let reply: ChatMessage = second[0].get("reply").unwrap().to_deserialize().unwrap();
    assert!(
        reply.text().contains("Alice"),
        "expected the remembered name, got: {}",
        reply.text()
    );

    // A different session shares nothing.
    let stranger = runner
        .run_session("session-other", turn("What's my name?"))
        .await
        .unwrap();
    let reply: ChatMessage = stranger[0].get("reply").unwrap().to_deserialize().unwrap();
    assert!(!reply.text().contains("Alice"));
}

#[tokio::test]
async fn rag_ingestion_and_query() {
    let ingest_ir = compile(
        r"
id: rag_ingest
models:
  - type: EmbeddingModel
    id: embedder
    provider: openai
    dimensions: 8
indexes:
  - type: vector
    id: store
    name: store
    embedding_model: embedder
flows:
  - id: ingest
    variables:
      - id: doc
        type: RAGDocument
      - id: chunk
        type: RAGChunk
      - id: embedded
        type: RAGChunk
    outputs: [agg.stats]
    steps:
      - type: DocumentSource
        id: docs
        reader_module: corpus
        outputs: [doc]
      - type: DocumentSplitter
        id: split
        chunk_size: 512
        chunk_overlap: 50
        inputs: [doc]
        outputs: [chunk]
      - type: DocumentEmbedder
        id: embed
        model: embedder
        concurrency: 5
        inputs: [chunk]
        outputs: [embedded]
      - type: IndexUpsert
        id: upsert
        index: store
        batch_size: 25
        inputs: [embedded]
      - type: Aggregate
        id: agg
        inputs: [embedded]
",
    );

    let mut providers = StubProviders::fixed("unused");
    providers.readers.insert(
        "corpus".to_string(),
        (0..34)
            .map(|i| {
                qtype_core::RagDocument::new(
                    format!("doc{i}"),
                    format!("Document {i} talks about topic {} at length. ", i % 7).repeat(40),
                )
            })
            .collect(),
    );
    let index = Arc::clone(&providers.index);

    let ingest = runner(ingest_ir, "ingest", providers);
    let results = ingest.run(BTreeMap::new()).await.unwrap();
    let stats = results[0].get("agg.stats").unwrap().to_json();
    assert_eq!(stats["num_failed"], 0);
    assert!(index.len() >= 34, "only {} chunks upserted", index.len());

    // Query flow against the same index.
    let query_ir = compile(
        r#"
id: rag_query
models:
  - type: Model
    id: gpt4
    provider: openai
  - type: EmbeddingModel
    id: embedder
    provider: openai
    dimensions: 8
indexes:
  - type: vector
    id: store
    name: store
    embedding_model: embedder
flows:
  - id: query
    variables:
      - id: chat_in
        type: ChatMessage
      - id: question
        type: text
      - id: hits
        type: list[RAGSearchResult]
      - id: reply
        type: ChatMessage
    inputs: [chat_in]
    outputs: [reply, hits]
    steps:
      - type: FieldExtractor
        id: extract
        json_path: $.blocks[0].content
        inputs: [chat_in]
        outputs: [question]
      - type: VectorSearch
        id: search
        index: store
        default_top_k: 5
        inputs: [question]
        outputs: [hits]
      - type: PromptTemplate
        id: contextualize
        template: "Answer '{question}' using: {hits}"
        inputs: [question, hits]
      - type: LLMInference
        id: answer
        model: gpt4
        inputs: [contextualize.prompt]
        outputs: [reply]
"#,
    );

    // The stub cites the first retrieved chunk id it sees in the prompt.
    let responder: support::Responder = Arc::new(|request| {
        let prompt = request
            .messages
            .last()
            .map(qtype_core::ChatMessage::text)
            .unwrap_or_default();
        let chunk_id = regex::Regex::new(r"doc\d+#\d+")
            .unwrap()
            .find(&prompt)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        let mut message = ChatMessage::assistant(format!("See {chunk_id}."));
        if !chunk_id.is_empty() {
            let doc_id = chunk_id.split('#').next().unwrap_or_default().to_string();
            message
                .blocks
                .push(qtype_core::ChatContent::citation_document(doc_id, chunk_id));
        }
        CompletionOutcome {
            message,
            tool_calls: Vec::new(),
        }
    });
    let mut query_providers = StubProviders::new(responder);
    query_providers.index = index.clone();

    let query = runner(query_ir, "query", query_providers);
    let results = query
        .run(BTreeMap::from([(
            "chat_in".to_string(),
            Value::from_serialize(&ChatMessage::user("What does document 3 talk about?")),
        )]))
        .await
        .unwrap();

    let hits = results[0].get("hits").unwrap().to_json();
    let hits = hits.as_array().unwrap();
    assert!(!hits.is_empty() && hits.len() <= 5);

    let reply: ChatMessage = results[0].get("reply").unwrap().to_deserialize().unwrap();
    let citations = reply.citations();
    assert_eq!(citations.len(), 1);
    let cited = citations[0].content.to_json();
    let cited_chunk = cited["chunk_id"].as_str().unwrap();
    assert!(index.chunk_ids().contains(&cited_chunk.to_string()));
}

#[tokio::test(start_paused = true)]
async fn cancellation_terminates_promptly() {
    let ir = compile(
        r"
id: slow
models:
  - type: Model
    id: gpt4
    provider: openai
memories:
  - id: chat_memory
flows:
  - id: main
    variables:
      - id: question
        type: text
    inputs: [question]
    outputs: [ask.response]
    steps:
      - type: LLMInference
        id: ask
        model: gpt4
        memory: chat_memory
        inputs: [question]
",
    );
    let mut providers = StubProviders::fixed("slow answer");
    providers.delay = Some(Duration::from_secs(5));
    let runner = runner(ir, "main", providers);

    let cancel = runner.cancel_handle();
    let started = tokio::time::Instant::now();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let result = runner
        .run_session(
            "cancelled-session",
            BTreeMap::from([("question".to_string(), Value::from("anything"))]),
        )
        .await;

    assert!(matches!(result, Err(qtype_core::QTypeError::Cancelled)));
    assert!(started.elapsed() < Duration::from_millis(200));
    assert!(runner.memory().is_empty("cancelled-session", "chat_memory"));
}

#[tokio::test]
async fn order_preserved_through_concurrent_fanout() {
    let ir = compile(
        r"
id: fan
flows:
  - id: main
    variables:
      - id: items
        type: list[text]
      - id: item
        type: text
      - id: copy
        type: text
      - id: gathered
        type: list[text]
    inputs: [items]
    outputs: [gathered]
    steps:
      - type: Explode
        id: fan_out
        inputs: [items]
        outputs: [item]
      - type: Echo
        id: work
        concurrency: 5
        inputs: [item]
        outputs: [copy]
      - type: Collect
        id: fan_in
        inputs: [copy]
        outputs: [gathered]
",
    );
    let runner = runner(ir, "main", StubProviders::fixed("unused"));

    let items: Vec<Value> = (0..50).map(|i| Value::from(format!("item-{i}"))).collect();
    let results = runner
        .run(BTreeMap::from([(
            "items".to_string(),
            Value::List(items.clone()),
        )]))
        .await
        .unwrap();

    let gathered = results
        .iter()
        .find_map(|m| m.get("gathered"))
        .unwrap()
        .clone();
    assert_eq!(gathered, Value::List(items));
}

#[tokio::test]
async fn failed_messages_skip_downstream_steps() {
    let ir = compile(
        r"
id: faulty
flows:
  - id: main
    variables:
      - id: raw
        type: text
      - id: parsed
        type: ChatMessage
      - id: copy
        type: ChatMessage
    inputs: [raw]
    outputs: [copy]
    steps:
      - type: Decoder
        id: parse
        format: json
        strict_mode: true
        inputs: [raw]
        outputs: [parsed]
      - type: Echo
        id: forward
        inputs: [parsed]
        outputs: [copy]
",
    );
    let runner = runner(ir, "main", StubProviders::fixed("unused"));
    let results = runner
        .run(BTreeMap::from([(
            "raw".to_string(),
            Value::from("this is not json"),
        )]))
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    let error = results[0].error().expect("message should carry the failure");
    assert_eq!(error.code, "DecodeError");
    assert_eq!(error.step_id.as_deref(), Some("parse"));
}

#[tokio::test]
async fn agent_runs_the_tool_call_cycle() {
    let ir = compile(
        r"
id: agentic
models:
  - type: Model
    id: gpt4
    provider: openai
tools:
  - type: function
    id: adder
    name: add_numbers
    description: Add two integers
    inputs:
      a: int
      b: int
    outputs:
      sum: int
    module_path: math
    function_name: add
flows:
  - id: main
    variables:
      - id: question
        type: text
    inputs: [question]
    outputs: [solve.response]
    steps:
      - type: Agent
        id: solve
        model: gpt4
        tools: [adder]
        inputs: [question]
",
    );

    // First round asks for the tool; once a tool result is visible, answer.
    let responder: support::Responder = Arc::new(|request| {
        let has_tool_result = request
            .messages
            .iter()
            .any(|m| m.role == qtype_core::types::chat::MessageRole::Tool);
        if has_tool_result {
            let sum = request
                .messages
                .iter()
                .rev()
                .find(|m| m.role == qtype_core::types::chat::MessageRole::Tool)
                .map(qtype_core::ChatMessage::text)
                .unwrap_or_default();
            CompletionOutcome {
                message: ChatMessage::assistant(format!("The answer is {sum}")),
                tool_calls: Vec::new(),
            }
        } else {
            CompletionOutcome {
                message: ChatMessage::assistant(""),
                tool_calls: vec![qtype_core::traits::model::ToolCallRequest {
                    call_id: "call-1".to_string(),
                    name: "add_numbers".to_string(),
                    arguments: serde_json::json!({"a": 2, "b": 3}),
                }],
            }
        }
    });
    let mut providers = StubProviders::new(responder);
    providers.functions.insert(
        "math.add".to_string(),
        Arc::new(support::StubFunction(|args: serde_json::Value| {
            let a = args["a"].as_i64().unwrap_or(0);
            let b = args["b"].as_i64().unwrap_or(0);
            Ok(serde_json::json!({"sum": a + b}))
        })),
    );

    let runner = runner(ir, "main", providers);
    let results = runner
        .run(BTreeMap::from([(
            "question".to_string(),
            Value::from("What is 2+3?"),
        )]))
        .await
        .unwrap();

    let response = results[0].get("solve.response").unwrap().render();
    assert!(response.contains('5'), "got: {response}");
}

#[tokio::test]
async fn agent_loop_exhaustion_is_fatal() {
    let ir = compile(
        r"
id: runaway
models:
  - type: Model
    id: gpt4
    provider: openai
tools:
  - type: function
    id: spin
    name: spin
    description: Never enough
    inputs: {}
    outputs: {}
    module_path: noop
    function_name: spin
flows:
  - id: main
    variables:
      - id: question
        type: text
    inputs: [question]
    outputs: [solve.response]
    steps:
      - type: Agent
        id: solve
        model: gpt4
        tools: [spin]
        max_iterations: 3
        inputs: [question]
",
    );

    // The model never stops asking for the tool.
    let responder: support::Responder = Arc::new(|_request| CompletionOutcome {
        message: ChatMessage::assistant(""),
        tool_calls: vec![qtype_core::traits::model::ToolCallRequest {
            call_id: "again".to_string(),
            name: "spin".to_string(),
            arguments: serde_json::json!({}),
        }],
    });
    let mut providers = StubProviders::new(responder);
    providers.functions.insert(
        "noop.spin".to_string(),
        Arc::new(support::StubFunction(|_args: serde_json::Value| {
            Ok(serde_json::json!({}))
        })),
    );

    let runner = runner(ir, "main", providers);
    let result = runner
        .run(BTreeMap::from([(
            "question".to_string(),
            Value::from("loop forever"),
        )]))
        .await;

    assert!(matches!(result, Err(qtype_core::QTypeError::Fatal { .. })));
}

#[tokio::test]
async fn flow_timeout_cancels_the_pipeline() {
    let ir = compile(
        r"
id: slowpoke
flows:
  - id: main
    variables:
      - id: x
        type: text
      - id: y
        type: text
    inputs: [x]
    outputs: [y]
    steps:
      - type: Echo
        id: dawdle
        delay_ms: 60000
        inputs: [x]
        outputs: [y]
",
    );
    let providers = StubProviders::fixed("unused");
    let deps = RunnerDeps::new(Arc::new(providers)).with_options(RuntimeOptions {
        flow_timeout_ms: Some(100),
        ..RuntimeOptions::default()
    });
    let runner = FlowRunner::new(ir, "main", deps).unwrap();

    tokio::time::pause();
    let result = runner
        .run(BTreeMap::from([("x".to_string(), Value::from("hi"))]))
        .await;
    assert!(matches!(result, Err(qtype_core::QTypeError::Cancelled)));
}
