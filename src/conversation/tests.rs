#![cfg(test)]

use crate::conversation::*;
use crate::testkit::{BOS_TOKEN, FakeModel};

#[test]
fn first_turn_feeds_the_full_render_with_bos() {
    let model = FakeModel::new();
    let mut convo = Conversation::new().unwrap();

    let batch = convo.begin_turn(&model, "Hi", true).unwrap();
    let tokens = batch.tokens();
    assert_eq!(tokens[0], BOS_TOKEN);
    assert_eq!(model.decode_text(tokens), "user:Hi\nassistant:");
    // The baseline moves on finish, not on begin.
    assert_eq!(convo.rendered_len_prev(), 0);
}

#[test]
fn second_turn_feeds_only_the_delta_without_bos() {
    let model = FakeModel::new();
    let mut convo = Conversation::new().unwrap();

    convo.begin_turn(&model, "Hi", true).unwrap();
    convo.finish_turn(&model, "Hello").unwrap();
    assert_eq!(convo.rendered_len_prev(), "user:Hi\nassistant:Hello\n".len());

    let batch = convo.begin_turn(&model, "How are you?", false).unwrap();
    let tokens = batch.tokens();
    assert_ne!(tokens[0], BOS_TOKEN);
    assert_eq!(model.decode_text(tokens), "user:How are you?\nassistant:");
}

#[test]
fn chat_requires_a_template() {
    let model = FakeModel::new().without_template();
    let mut convo = Conversation::new().unwrap();
    let err = convo.begin_turn(&model, "Hi", true).unwrap_err();
    assert!(matches!(err, crate::error::EngineError::Misuse(_)));
    assert!(convo.messages().is_empty());
}

#[test]
fn failed_turn_start_leaves_the_message_list_untouched() {
    let model = FakeModel::new();
    let mut convo = Conversation::new().unwrap();
    convo.begin_turn(&model, "Hi", true).unwrap();
    convo.finish_turn(&model, "Hello").unwrap();
    let baseline = convo.rendered_len_prev();

    model.state.fail_next_tokenize.set(true);
    assert!(convo.begin_turn(&model, "again", false).is_err());
    assert_eq!(convo.messages().len(), 2);
    assert_eq!(convo.rendered_len_prev(), baseline);
}

#[test]
fn render_grows_and_retries_for_oversized_histories() {
    let model = FakeModel::new();
    let mut convo = Conversation::new().unwrap();
    // Larger than the initial buffer floor, so the first render call has
    // to come back asking for room.
    let long = "x".repeat(8 * 1024);
    let batch = convo.begin_turn(&model, &long, true).unwrap();
    assert_eq!(
        model.decode_text(batch.tokens()),
        format!("user:{long}\nassistant:")
    );
}

#[test]
fn restored_conversations_start_with_a_zero_baseline() {
    let model = FakeModel::new();
    let id = uuid::Uuid::now_v7();
    let messages = vec![Message::user("Hi"), Message::assistant("Hello")];
    let mut convo = Conversation::restored(id, messages).unwrap();
    assert_eq!(convo.id(), id);
    assert_eq!(convo.rendered_len_prev(), 0);

    // The next turn re-feeds the whole restored history.
    let batch = convo.begin_turn(&model, "More?", true).unwrap();
    assert_eq!(
        model.decode_text(batch.tokens()),
        "user:Hi\nassistant:Hello\nuser:More?\nassistant:"
    );
}

#[test]
fn system_messages_render_ahead_of_the_first_turn() {
    let model = FakeModel::new();
    let id = uuid::Uuid::now_v7();
    let mut convo =
        Conversation::restored(id, vec![Message::system("Be terse.")]).unwrap();

    let batch = convo.begin_turn(&model, "Hi", true).unwrap();
    assert_eq!(
        model.decode_text(batch.tokens()),
        "system:Be terse.\nuser:Hi\nassistant:"
    );
    assert!(convo.rendered_text().starts_with("system:Be terse.\n"));
}

#[test]
fn roles_round_trip_through_names() {
    for role in [
        Role::System,
        Role::User,
        Role::Assistant,
        Role::Other("tool".into()),
    ] {
        assert_eq!(Role::from_name(role.as_str()), role);
    }
}
