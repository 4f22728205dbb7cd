mod common;

use common::{TestHub, started_id, template};
use serde_json::json;
use taskhub::error::HubError;
use taskhub::protocol::{Command, CommandArgs, Envelope, Inbound, PipelineTicket};
use taskhub::runtime::Outcome;

fn ticket_of(envelope: &Envelope) -> PipelineTicket {
    envelope.pipeline.clone().expect("Envelope carries no pipeline ticket")
}

fn done() -> CommandArgs {
    CommandArgs {
        coprocessing_done: true,
        ..Default::default()
    }
}

/// p1 edits in `ui`; c1 (priority 5) and c2 (priority 1) review everything.
async fn hub_with_reviewers() -> TestHub {
    let mut t = TestHub::new(vec![template("doc", &["ui"])]).await;
    t.processor("p1", "ui").await;
    t.coprocessor("c1", "policy", 5).await;
    t.coprocessor("c2", "audit", 1).await;
    t
}

/// Starts `doc` and lets c1 wave it through.
async fn committed_doc(t: &mut TestHub) -> String {
    let parked = t.start("p1", "doc").await.unwrap();
    let id = parked.instance_id().unwrap().to_string();
    let envelope = t.drain("c1").pop().unwrap();
    t.send(
        Inbound::new("c1", Command::Init)
            .instance(&id)
            .ticket(ticket_of(&envelope))
            .args(done()),
    )
    .await
    .unwrap();
    t.drain_all();
    id
}

#[tokio::test]
async fn test_init_passes_every_coprocessor_in_order() {
    let mut t = hub_with_reviewers().await;

    let outcome = t.start("p1", "doc").await.unwrap();
    let id = match &outcome {
        Outcome::Parked {
            instance_id,
            coprocessor,
            ..
        } => {
            assert_eq!(coprocessor, "c1");
            instance_id.clone()
        }
        other => panic!("Expected Parked, got {:?}", other),
    };
    assert!(t.hub.instance(&id).await.unwrap().is_none());
    assert!(t.drain("p1").is_empty());
    assert!(t.drain("c2").is_empty());

    let to_c1 = t.drain("c1");
    assert_eq!(to_c1.len(), 1);
    assert_eq!(to_c1[0].command, Command::Init);
    assert!(to_c1[0].full);
    assert_eq!(to_c1[0].source_node_id.as_deref(), Some("p1"));

    let outcome = t
        .send(
            Inbound::new("c1", Command::Init)
                .instance(&id)
                .ticket(ticket_of(&to_c1[0]))
                .body(json!({ "input": { "approved": true } })),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::Parked { ref coprocessor, .. } if coprocessor == "c2"));

    let to_c2 = t.drain("c2");
    assert_eq!(to_c2.len(), 1);
    assert_eq!(to_c2[0].task["input"]["approved"], true);

    let outcome = t
        .send(
            Inbound::new("c2", Command::Init)
                .instance(&id)
                .ticket(ticket_of(&to_c2[0])),
        )
        .await
        .unwrap();
    assert_eq!(started_id(&outcome), id);

    let init = t.drain("p1");
    assert_eq!(init.len(), 1);
    assert_eq!(init[0].command, Command::Init);
    assert_eq!(init[0].task["input"]["approved"], true);

    let record = t.hub.active_record(&id).await.unwrap().unwrap();
    assert!(record.active);
    assert!(record.pending.is_empty());
}

#[tokio::test]
async fn test_coprocessing_done_skips_the_rest() {
    let mut t = hub_with_reviewers().await;
    let id = committed_doc(&mut t).await;

    assert_eq!(t.task(&id).await.template_id, "doc");
    assert!(t.drain("c2").is_empty());
}

#[tokio::test]
async fn test_rewritten_update_goes_back_to_sender() {
    let mut t = hub_with_reviewers().await;
    let id = committed_doc(&mut t).await;

    let outcome = t.update("p1", &id, json!({ "input": { "x": 1 } })).await.unwrap();
    assert!(matches!(outcome, Outcome::Parked { ref coprocessor, .. } if coprocessor == "c1"));

    // not committed yet, but the request was counted
    let stored = t.task(&id).await;
    assert!(stored.input.get("x").is_none());
    assert_eq!(stored.meta.request_count, 1);

    let to_c1 = t.drain("c1").pop().unwrap();
    assert_eq!(to_c1.command, Command::Update);
    assert_eq!(to_c1.task["input"]["x"], 1);

    let outcome = t
        .send(
            Inbound::new("c1", Command::Update)
                .instance(&id)
                .ticket(ticket_of(&to_c1))
                .args(done())
                .body(json!({ "input": { "y": 2 } })),
        )
        .await
        .unwrap();
    assert_eq!(
        outcome,
        Outcome::Committed {
            instance_id: id.clone(),
            update_count: 1
        }
    );

    let task = t.task(&id).await;
    assert_eq!(task.input, json!({ "x": 1, "y": 2 }));

    let back = t.drain("p1");
    assert_eq!(back.len(), 1);
    assert_eq!(back[0].task, json!({ "input": { "x": 1, "y": 2 } }));
}

#[tokio::test]
async fn test_unregistered_coprocessor_is_skipped() {
    let mut t = hub_with_reviewers().await;
    let id = committed_doc(&mut t).await;

    t.update("p1", &id, json!({ "input": { "x": 1 } })).await.unwrap();
    assert_eq!(t.drain("c1").len(), 1);

    t.hub.unregister("c1").await.unwrap();
    let to_c2 = t.drain("c2");
    assert_eq!(to_c2.len(), 1);
    assert_eq!(to_c2[0].command, Command::Update);

    let outcome = t
        .send(
            Inbound::new("c2", Command::Update)
                .instance(&id)
                .ticket(ticket_of(&to_c2[0]))
                .args(done()),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::Committed { update_count: 1, .. }));
    assert_eq!(t.task(&id).await.input["x"], 1);
}

#[tokio::test]
async fn test_reply_from_wrong_coprocessor_is_rejected() {
    let mut t = hub_with_reviewers().await;
    let id = committed_doc(&mut t).await;

    t.update("p1", &id, json!({ "input": { "x": 1 } })).await.unwrap();
    let to_c1 = t.drain("c1").pop().unwrap();

    let err = t
        .send(
            Inbound::new("c2", Command::Update)
                .instance(&id)
                .ticket(ticket_of(&to_c1))
                .args(done()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Protocol(_)));
    assert!(t.task(&id).await.input.get("x").is_none());
}

#[tokio::test]
async fn test_coprocessor_updates_commit_directly() {
    let mut t = hub_with_reviewers().await;
    let id = committed_doc(&mut t).await;

    let outcome = t.update("c1", &id, json!({ "input": { "flag": "ok" } })).await.unwrap();
    assert!(matches!(outcome, Outcome::Committed { .. }));
    assert!(t.drain("c2").is_empty());
    assert_eq!(t.drain("p1").len(), 1);
}

#[tokio::test]
async fn test_error_passes_pipeline_before_routing() {
    let mut t = hub_with_reviewers().await;
    let id = committed_doc(&mut t).await;

    let outcome = t
        .send(
            Inbound::new("p1", Command::Error)
                .instance(&id)
                .body(json!({ "error": "bad input" })),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::Parked { .. }));
    assert!(t.task(&id).await.error.is_none());

    let to_c1 = t.drain("c1").pop().unwrap();
    assert_eq!(to_c1.command, Command::Error);
    let outcome = t
        .send(
            Inbound::new("c1", Command::Error)
                .instance(&id)
                .ticket(ticket_of(&to_c1))
                .args(done()),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::ErrorRouted { .. }));
    assert_eq!(t.task(&id).await.error.unwrap().message, "bad input");
}

#[tokio::test]
async fn test_rewrite_after_delete_replaces_the_field() {
    let mut t = hub_with_reviewers().await;
    let id = committed_doc(&mut t).await;

    t.update("p1", &id, json!({ "input": { "x": 1 } })).await.unwrap();
    let to_c1 = t.drain("c1").pop().unwrap();
    t.send(
        Inbound::new("c1", Command::Update)
            .instance(&id)
            .ticket(ticket_of(&to_c1))
            .args(done()),
    )
    .await
    .unwrap();
    assert_eq!(t.task(&id).await.input, json!({ "x": 1 }));
    t.drain_all();

    t.update("p1", &id, json!({ "input": null })).await.unwrap();
    let to_c1 = t.drain("c1").pop().unwrap();
    assert!(to_c1.task.get("input").is_none_or(|input| input.get("x").is_none()));

    // the stage round-trips through storage between the two messages
    let record = t.hub.active_record(&id).await.unwrap().unwrap();
    assert_eq!(record.pending.len(), 1);

    t.send(
        Inbound::new("c1", Command::Update)
            .instance(&id)
            .ticket(ticket_of(&to_c1))
            .args(done())
            .body(json!({ "input": { "y": 2 } })),
    )
    .await
    .unwrap();

    assert_eq!(t.task(&id).await.input, json!({ "y": 2 }));
    let back = t.drain("p1");
    assert_eq!(back.len(), 1);
    assert_eq!(back[0].task["input"], json!({ "x": null, "y": 2 }));
}
