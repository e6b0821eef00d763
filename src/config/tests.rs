#![cfg(test)]

use crate::config::*;

#[test]
fn context_options_apply_recognized_keys() {
    let mut opts = ContextOptions::default();
    opts.apply_pairs(
        [
            ("context_size", "2048"),
            ("pooling_type", "mean"),
            ("attention_type", "non_causal"),
            ("rope_freq_base", "10000.0"),
            ("flash_attention", "on"),
        ],
        UnknownKeyPolicy::Reject,
    )
    .unwrap();

    assert_eq!(opts.context_size, 2048);
    // batch follows context when not set explicitly
    assert_eq!(opts.batch_size, 2048);
    assert_eq!(opts.pooling_type, PoolingType::Mean);
    assert_eq!(opts.attention_type, AttentionType::NonCausal);
    assert_eq!(opts.rope_freq_base, 10000.0);
    assert_eq!(opts.flash_attention, FlashAttention::On);
}

#[test]
fn explicit_batch_size_is_not_overridden() {
    let mut opts = ContextOptions::default();
    opts.apply_pairs(
        [("batch_size", "256"), ("context_size", "4096")],
        UnknownKeyPolicy::Reject,
    )
    .unwrap();
    assert_eq!(opts.batch_size, 256);
    assert_eq!(opts.context_size, 4096);
}

#[test]
fn keys_are_case_insensitive() {
    let mut opts = ContextOptions::default();
    opts.apply_pairs([("Context_Size", "128")], UnknownKeyPolicy::Reject)
        .unwrap();
    assert_eq!(opts.context_size, 128);
}

#[test]
fn unknown_keys_follow_policy() {
    let mut opts = ContextOptions::default();
    // Permissive default: unknown keys are dropped without complaint.
    opts.apply_pairs([("warp_drive", "9")], UnknownKeyPolicy::Ignore)
        .unwrap();

    let err = opts
        .apply_pairs([("warp_drive", "9")], UnknownKeyPolicy::Reject)
        .unwrap_err();
    assert_eq!(err.0, vec![ConfigError::UnknownKey("warp_drive".into())]);
}

#[test]
fn every_problem_is_collected_in_one_pass() {
    let mut opts = ContextOptions::default();
    let err = opts
        .apply_pairs(
            [
                ("context_size", "many"),
                ("pooling_type", "average"),
                ("rope_freq_scale", "-1"),
            ],
            UnknownKeyPolicy::Ignore,
        )
        .unwrap_err();
    assert_eq!(err.0.len(), 3);
    let rendered = err.to_string();
    assert!(rendered.contains("context_size"));
    assert!(rendered.contains("pooling_type"));
    assert!(rendered.contains("rope_freq_scale"));
}

#[test]
fn generate_options_recognize_max_tokens() {
    let mut opts = GenerateOptions::default();
    opts.apply_pairs([("MAX_TOKENS", "64")], UnknownKeyPolicy::Reject)
        .unwrap();
    assert_eq!(opts.max_tokens, 64);

    let err = opts
        .apply_pairs([("max_tokens", "-5")], UnknownKeyPolicy::Ignore)
        .unwrap_err();
    assert_eq!(err.0.len(), 1);
}
