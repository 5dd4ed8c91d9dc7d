use std::collections::HashMap;

use anyhow::Result;
use attention::masks::padding_mask_from_lengths;
use attention::{
    HeadsHint, KeyValueState, SelfAttention, SelfAttentionConfig, T5Args, T5Attention, T5Config,
};
use candle_core::{DType, Device, Tensor};

fn tiny_t5() -> T5Config {
    T5Config {
        hidden_size: 8,
        key_value_proj_dim: 4,
        num_heads: 2,
        relative_attention_num_buckets: 8,
        ..T5Config::default()
    }
}

#[test]
fn t5_layers_share_the_first_layers_bias() -> Result<()> {
    let device = Device::Cpu;
    let first = T5Attention::new(&tiny_t5().with_relative_bias(), &device, DType::F32)?;
    let second = T5Attention::new(&tiny_t5(), &device, DType::F32)?;
    let hidden = Tensor::randn(0f32, 1.0, (2, 4, 8), &device)?;
    let mask = padding_mask_from_lengths(&device, &[4, 3], 4)?;

    let out = first.forward(
        &hidden,
        T5Args {
            mask: Some(&mask),
            ..T5Args::default()
        },
    )?;
    let bias = out.position_bias.expect("bias returned");
    assert_eq!(bias.dims(), &[2, 2, 4, 4]);

    // The masked bias is passed on together with the mask, as stacked layers do.
    let next = second.forward(
        &out.hidden_states,
        T5Args {
            mask: Some(&mask),
            position_bias: Some(&bias),
            output_attentions: true,
            ..T5Args::default()
        },
    )?;
    let probs = next.attention_probs.expect("requested");
    let row = probs.get(1)?.get(0)?.get(0)?.to_vec1::<f32>()?;
    assert!(row[3] < 1e-6, "padded key attended: {row:?}");
    assert!(probs.flatten_all()?.to_vec1::<f32>()?.iter().all(|p| p.is_finite()));
    Ok(())
}

#[test]
fn t5_cross_attention_masks_encoder_positions() -> Result<()> {
    let device = Device::Cpu;
    let config = tiny_t5().decoder(true);
    let attention = T5Attention::new(&config, &device, DType::F32)?;
    let decoder_states = Tensor::randn(0f32, 1.0, (1, 2, 8), &device)?;
    let encoder_states = Tensor::randn(0f32, 1.0, (1, 5, 8), &device)?;
    let encoder_mask = padding_mask_from_lengths(&device, &[3], 5)?;

    let out = attention.forward(
        &decoder_states,
        T5Args {
            mask: Some(&encoder_mask),
            key_value_states: Some(&encoder_states),
            use_cache: true,
            output_attentions: true,
            ..T5Args::default()
        },
    )?;
    let probs = out.attention_probs.expect("requested");
    assert_eq!(probs.dims(), &[1, 2, 2, 5]);
    for (idx, p) in probs.flatten_all()?.to_vec1::<f32>()?.iter().enumerate() {
        if idx % 5 >= 3 {
            assert!(*p < 1e-6);
        }
    }
    let state: KeyValueState = out.key_value_state.expect("cache requested");
    assert_eq!(state.seq_len(), 5);
    Ok(())
}

#[test]
fn t5_decoder_steps_extend_the_cache() -> Result<()> {
    let device = Device::Cpu;
    let config = tiny_t5().with_relative_bias().decoder(false);
    let attention = T5Attention::new(&config, &device, DType::F32)?;

    let mut state = None;
    for step in 0..3 {
        let token = Tensor::randn(0f32, 1.0, (1, 1, 8), &device)?;
        let out = attention.forward(
            &token,
            T5Args {
                past_key_value: state.as_ref(),
                use_cache: true,
                ..T5Args::default()
            },
        )?;
        assert_eq!(out.hidden_states.dims(), &[1, 1, 8]);
        assert_eq!(
            out.position_bias.expect("bias returned").dims(),
            &[1, 2, 1, step + 1]
        );
        state = out.key_value_state;
    }
    assert_eq!(state.map(|s| s.seq_len()), Some(3));
    Ok(())
}

#[test]
fn t5_loads_hugging_face_names() -> Result<()> {
    let device = Device::Cpu;
    let config = tiny_t5().with_relative_bias();
    let reference = T5Attention::new(&config, &device, DType::F32)?;
    let exported: HashMap<String, Tensor> = reference
        .inner()
        .named_parameters()
        .into_iter()
        .map(|(name, tensor)| {
            let name = match name.split_once('.') {
                Some(("query", rest)) => format!("q.{rest}"),
                Some(("key", rest)) => format!("k.{rest}"),
                Some(("value", rest)) => format!("v.{rest}"),
                Some(("output", rest)) => format!("o.{rest}"),
                _ => name,
            };
            (name, tensor)
        })
        .collect();
    assert!(exported.contains_key("q.weight"));

    let loaded = T5Attention::from_pretrained(&config, &exported)?;
    let hidden = Tensor::randn(0f32, 1.0, (1, 3, 8), &device)?;
    let expected = reference.forward(&hidden, T5Args::default())?.hidden_states;
    let actual = loaded.forward(&hidden, T5Args::default())?.hidden_states;
    assert_eq!(expected.sub(&actual)?.abs()?.max_all()?.to_vec0::<f32>()?, 0.0);
    Ok(())
}

#[test]
fn bert_self_attention_loads_plain_names() -> Result<()> {
    let device = Device::Cpu;
    let config = SelfAttentionConfig::new(8, 2);
    let reference = SelfAttention::new(&config, &device, DType::F32)?;
    let tensors: HashMap<String, Tensor> = reference.inner().named_parameters().into_iter().collect();

    let loaded = SelfAttention::from_pretrained(
        &tensors,
        HeadsHint {
            num_attention_heads: Some(2),
            ..HeadsHint::default()
        },
        0.1,
    )?;
    assert!(!loaded.inner().config().output_projection);
    assert_eq!(loaded.inner().config().dropout, 0.1);

    let hidden = Tensor::randn(0f32, 1.0, (2, 3, 8), &device)?;
    let mask = padding_mask_from_lengths(&device, &[3, 1], 3)?;
    let (expected, _) = reference.forward(&hidden, Some(&mask), None, false)?;
    let (actual, probs) = loaded.forward(&hidden, Some(&mask), None, true)?;
    assert_eq!(expected.sub(&actual)?.abs()?.max_all()?.to_vec0::<f32>()?, 0.0);

    // Second sequence has a single real token, so every row attends to it alone.
    let probs = probs.expect("requested").get(1)?.flatten_all()?.to_vec1::<f32>()?;
    for (idx, p) in probs.iter().enumerate() {
        let expected = if idx % 3 == 0 { 1.0 } else { 0.0 };
        assert!((p - expected).abs() < 1e-6);
    }
    Ok(())
}
