use candle_core::{DType, Device, Result, Tensor};
use embedding::positional::{
    sinusoid_table, AbsolutePositionalEncoding, LocalRelPositionalEncoding, PositionalConfig,
    RelPositionalEncoding,
};
use static_assertions::assert_impl_all;

assert_impl_all!(AbsolutePositionalEncoding: Send, Sync);
assert_impl_all!(RelPositionalEncoding: Send, Sync);
assert_impl_all!(LocalRelPositionalEncoding: Send, Sync);

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    a.to_dtype(DType::F32)?
        .sub(&b.to_dtype(DType::F32)?)?
        .abs()?
        .max_all()?
        .to_vec0::<f32>()
}

fn small_config(d_model: usize, max_len: usize) -> PositionalConfig {
    PositionalConfig {
        max_len,
        ..PositionalConfig::new(d_model)
    }
}

#[test]
fn absolute_growth_is_prefix_idempotent() -> Result<()> {
    let device = Device::Cpu;
    let mut pe = AbsolutePositionalEncoding::new(small_config(8, 4), &device)?;
    let before = pe.table().clone();
    pe.ensure_length(3)?;
    assert_eq!(pe.len(), 4, "shorter request must not regenerate");

    pe.ensure_length(11)?;
    assert_eq!(pe.len(), 11);
    let prefix = pe.table().narrow(1, 0, 4)?;
    assert_eq!(max_abs_diff(&prefix, &before)?, 0.0);
    Ok(())
}

#[test]
fn absolute_forward_adds_scaled_table() -> Result<()> {
    let device = Device::Cpu;
    let mut pe = AbsolutePositionalEncoding::new(small_config(4, 2).with_sqrt_xscale(), &device)?;
    let x = Tensor::ones((2, 5, 4), DType::F32, &device)?;
    let (out, pos_emb) = pe.forward(&x)?;

    assert_eq!(pos_emb.dims(), &[1, 5, 4]);
    assert_eq!(pe.len(), 5);
    let expected = pos_emb.broadcast_add(&Tensor::full(2f32, (2, 5, 4), &device)?)?;
    assert!(max_abs_diff(&out, &expected)? < 1e-6);
    Ok(())
}

#[test]
fn relative_window_is_centered_on_offset_zero() -> Result<()> {
    let device = Device::Cpu;
    let mut pe = RelPositionalEncoding::new(small_config(6, 3), &device)?;
    let x = Tensor::zeros((1, 4, 6), DType::F32, &device)?;
    let (_, pos_emb) = pe.forward(&x, 2)?;

    // query + cache = 6 frames -> offsets 5 ..= -5
    assert_eq!(pos_emb.dims(), &[1, 11, 6]);
    assert!(pe.max_length() >= 6);
    let offsets: Vec<f64> = (-5..=5).rev().map(|p| p as f64).collect();
    let expected = sinusoid_table(&offsets, 6, &device)?;
    assert!(max_abs_diff(&pos_emb, &expected)? < 1e-6);
    Ok(())
}

#[test]
fn relative_growth_keeps_existing_windows() -> Result<()> {
    let device = Device::Cpu;
    let mut pe = RelPositionalEncoding::new(small_config(8, 3), &device)?;
    let small = pe.window(3)?;
    pe.ensure_length(40)?;
    assert_eq!(pe.table().dims(), &[1, 79, 8]);
    let again = pe.window(3)?;
    assert!(max_abs_diff(&small, &again)? < 1e-6);
    Ok(())
}

#[test]
fn local_table_covers_window_and_never_grows() -> Result<()> {
    let device = Device::Cpu;
    let pe = LocalRelPositionalEncoding::new(small_config(4, 1), [3, 1], &device)?;
    assert_eq!(pe.context(), (3, 1));

    let long = Tensor::zeros((1, 64, 4), DType::F32, &device)?;
    let (_, pos_emb) = pe.forward(&long)?;
    assert_eq!(pos_emb.dims(), &[1, 5, 4]);

    let expected = sinusoid_table(&[3.0, 2.0, 1.0, 0.0, -1.0], 4, &device)?;
    assert!(max_abs_diff(&pos_emb, &expected)? < 1e-6);
    Ok(())
}

#[test]
fn local_rejects_negative_context() {
    let device = Device::Cpu;
    assert!(LocalRelPositionalEncoding::new(small_config(4, 1), [-1, 2], &device).is_err());
}

#[test]
fn reduced_precision_inputs_receive_matching_embeddings() -> Result<()> {
    let device = Device::Cpu;
    let mut pe = RelPositionalEncoding::new(small_config(4, 2), &device)?;
    let x = Tensor::zeros((1, 3, 4), DType::F16, &device)?;
    let (out, pos_emb) = pe.forward(&x, 0)?;
    assert_eq!(out.dtype(), DType::F16);
    assert_eq!(pos_emb.dtype(), DType::F16);
    Ok(())
}

#[test]
fn dropout_is_identity_outside_training() -> Result<()> {
    let device = Device::Cpu;
    let config = PositionalConfig {
        dropout_p: 0.5,
        emb_dropout_p: 0.5,
        ..small_config(4, 2)
    };
    let mut pe = AbsolutePositionalEncoding::new(config, &device)?;
    let x = Tensor::ones((1, 2, 4), DType::F32, &device)?;
    let (first, _) = pe.forward(&x)?;
    let (second, _) = pe.forward(&x)?;
    assert_eq!(max_abs_diff(&first, &second)?, 0.0);

    pe.set_training(true);
    let (trained, _) = pe.forward(&Tensor::ones((1, 64, 4), DType::F32, &device)?)?;
    let zeros = trained.eq(0f32)?.to_dtype(DType::F32)?.sum_all()?.to_vec0::<f32>()?;
    assert!(zeros > 0.0);
    Ok(())
}
