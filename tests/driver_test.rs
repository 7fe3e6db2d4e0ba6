mod common;

use common::{api_error, interact, setup_pool, ScriptedGenerator, ScriptedTutor};
use tutorbench::db::{self, NewConversation};
use tutorbench::driver::{run_conversation, DriveOutcome, DriveRequest};
use tutorbench::generate::TranscriptTurn;
use tutorbench::model::{ConversationStatus, MessageRole, SetType};

fn new_convo(budget: i64) -> NewConversation<'static> {
    NewConversation {
        external_conversation_id: "ext-1",
        student_id: "student-1",
        student_name: "Ada",
        topic_id: "topic-1",
        topic_name: "Fractions",
        subject_name: "Math",
        set_type: SetType::MiniDev,
        messages_remaining: budget,
        is_auto: true,
        is_running: true,
        system_prompt: Some("be kind"),
        initial_message: Some("opener"),
        batch_id: None,
    }
}

fn drive_request(conversation_id: i64, budget: i64) -> DriveRequest {
    DriveRequest {
        conversation_id,
        external_id: "ext-1".to_string(),
        system_prompt: "be kind".to_string(),
        seed_message: Some("opener".to_string()),
        turns_budget: budget,
        transcript: Vec::new(),
    }
}

#[tokio::test]
async fn run_alternates_seed_and_generated_messages() {
    let pool = setup_pool().await;
    let convo = db::insert_conversation(&pool, &new_convo(5)).await.unwrap();

    let tutor = ScriptedTutor::new();
    tutor.queue_interact(Ok(interact("r1", false))).await;
    tutor.queue_interact(Ok(interact("r2", false))).await;
    tutor.queue_interact(Ok(interact("r3", true))).await;
    let generator = ScriptedGenerator::with_responses(vec![Ok("g1".into()), Ok("g2".into())]);

    let outcome = run_conversation(&pool, &tutor, &generator, drive_request(convo.id, 5))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        DriveOutcome {
            turns_taken: 3,
            completed: true
        }
    );

    // Turn 1 sends the seed; every later turn sends a generated message.
    let sent = tutor.sent().await;
    assert_eq!(
        sent,
        vec![
            ("ext-1".to_string(), "opener".to_string()),
            ("ext-1".to_string(), "g1".to_string()),
            ("ext-1".to_string(), "g2".to_string()),
        ]
    );

    // The generator sees the full history up to each call.
    let calls = generator.calls().await;
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[0],
        vec![
            TranscriptTurn::tutor("opener"),
            TranscriptTurn::student("r1"),
        ]
    );
    assert_eq!(calls[1].len(), 4);

    let messages = db::list_messages(&pool, convo.id).await.unwrap();
    let replay: Vec<(MessageRole, &str)> =
        messages.iter().map(|m| (m.role, m.content.as_str())).collect();
    assert_eq!(
        replay,
        vec![
            (MessageRole::Tutor, "opener"),
            (MessageRole::Student, "r1"),
            (MessageRole::Tutor, "g1"),
            (MessageRole::Student, "r2"),
            (MessageRole::Tutor, "g2"),
            (MessageRole::Student, "r3"),
        ]
    );

    let convo = db::get_conversation(&pool, convo.id).await.unwrap().unwrap();
    assert_eq!(convo.status, ConversationStatus::Closed);
    assert_eq!(convo.messages_remaining, 2);
    assert!(!convo.is_running);
}

#[tokio::test]
async fn budget_exhaustion_leaves_conversation_open() {
    let pool = setup_pool().await;
    let convo = db::insert_conversation(&pool, &new_convo(2)).await.unwrap();

    let tutor = ScriptedTutor::new();
    let generator = ScriptedGenerator::new();

    let outcome = run_conversation(&pool, &tutor, &generator, drive_request(convo.id, 2))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        DriveOutcome {
            turns_taken: 2,
            completed: false
        }
    );

    let convo = db::get_conversation(&pool, convo.id).await.unwrap().unwrap();
    assert_eq!(convo.status, ConversationStatus::Open);
    assert_eq!(convo.messages_remaining, 0);
    assert!(!convo.is_running);
    assert_eq!(db::list_messages(&pool, convo.id).await.unwrap().len(), 4);
}

#[tokio::test]
async fn zero_budget_run_makes_no_calls() {
    let pool = setup_pool().await;
    let convo = db::insert_conversation(&pool, &new_convo(0)).await.unwrap();

    let tutor = ScriptedTutor::new();
    let generator = ScriptedGenerator::new();

    let outcome = run_conversation(&pool, &tutor, &generator, drive_request(convo.id, 0))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        DriveOutcome {
            turns_taken: 0,
            completed: false
        }
    );
    assert!(tutor.sent().await.is_empty());
    assert!(generator.calls().await.is_empty());
    assert!(db::list_messages(&pool, convo.id).await.unwrap().is_empty());

    // Even a no-op run releases the conversation.
    let convo = db::get_conversation(&pool, convo.id).await.unwrap().unwrap();
    assert!(!convo.is_running);
}

#[tokio::test]
async fn mid_run_failure_keeps_finished_turns() {
    let pool = setup_pool().await;
    let convo = db::insert_conversation(&pool, &new_convo(4)).await.unwrap();

    let tutor = ScriptedTutor::new();
    tutor.queue_interact(Ok(interact("r1", false))).await;
    tutor.queue_interact(Err(api_error(500))).await;
    let generator = ScriptedGenerator::new();

    let err = run_conversation(&pool, &tutor, &generator, drive_request(convo.id, 4))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("turn 2"));

    // The first turn stays persisted and the conversation is resumable.
    assert_eq!(tutor.sent().await.len(), 2);
    assert_eq!(db::list_messages(&pool, convo.id).await.unwrap().len(), 2);
    let convo = db::get_conversation(&pool, convo.id).await.unwrap().unwrap();
    assert_eq!(convo.status, ConversationStatus::Open);
    assert_eq!(convo.messages_remaining, 3);
    assert!(!convo.is_running);
}

#[tokio::test]
async fn generation_failure_stops_before_sending() {
    let pool = setup_pool().await;
    let convo = db::insert_conversation(&pool, &new_convo(3)).await.unwrap();

    let tutor = ScriptedTutor::new();
    tutor.queue_interact(Ok(interact("r1", false))).await;
    let generator =
        ScriptedGenerator::with_responses(vec![Err(anyhow::anyhow!("model offline"))]);

    let err = run_conversation(&pool, &tutor, &generator, drive_request(convo.id, 3))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("generate"));

    // Nothing half-sent: only the completed first turn is stored.
    assert_eq!(tutor.sent().await.len(), 1);
    assert_eq!(db::list_messages(&pool, convo.id).await.unwrap().len(), 2);
    let convo = db::get_conversation(&pool, convo.id).await.unwrap().unwrap();
    assert_eq!(convo.messages_remaining, 2);
    assert!(!convo.is_running);
}
