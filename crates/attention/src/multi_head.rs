//! Multi-head attention layer with pluggable scoring.
//!
//! [`MultiHeadAttention`] owns the query/key/value/output projections and one
//! of three scoring strategies selected by [`AttentionKind`]. Inputs are
//! `(batch, time, feature)`; the output has the query's shape and dtype.
//!
//! With a cache the slot assigned through [`MultiHeadAttention::set_cache_id`]
//! is prepended to the incoming key stream and the layer attends over
//! `cache_len + time_k` frames. Key and value are both taken from the
//! extended key stream in that case; the `value` argument is not used.

use std::fmt;
use std::sync::OnceLock;

use candle_core::{DType, Device, Tensor};
use layers::{Linear, LinearConfig, LinearInit, LinearLayer, PrecisionPolicy};

use crate::banded::LocalRelPositionAttention;
use crate::core::{Attention, AttentionConfig, AttentionError, AttentionKind, Config, PrecisionMode};
use crate::kv_cache::{next_cache_state, CacheAccess};
use crate::reference::ExactAttention;
use crate::relative::{PositionBias, RelPositionAttention, RelPositionBias};

/// Query, key, value and output projections, each `feature -> feature`.
#[derive(Debug, Clone)]
pub struct Projections {
    pub linear_q: Linear,
    pub linear_k: Linear,
    pub linear_v: Linear,
    pub linear_out: Linear,
}

impl Projections {
    /// Randomly initialised projections with zero bias.
    pub fn with_init(
        feature: usize,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        let build = || Linear::with_init(LinearConfig::new(feature, feature), init, device, dtype);
        Ok(Self {
            linear_q: build()?,
            linear_k: build()?,
            linear_v: build()?,
            linear_out: build()?,
        })
    }

    fn validate(&self, feature: usize) -> Result<(), AttentionError> {
        for (name, linear) in [
            ("linear_q", &self.linear_q),
            ("linear_k", &self.linear_k),
            ("linear_v", &self.linear_v),
            ("linear_out", &self.linear_out),
        ] {
            let config = linear.config();
            if config.input_dim != feature || config.output_dim != feature {
                return Err(AttentionError::config(format!(
                    "{name} must map {feature} -> {feature}, got {} -> {}",
                    config.input_dim, config.output_dim
                )));
            }
        }
        Ok(())
    }
}

/// Parameters of the relative-position variants.
#[derive(Debug, Clone)]
pub struct RelativeParts {
    /// Bias-free `feature -> feature` projection of the positional embedding.
    pub linear_pos: Linear,
    pub bias: PositionBias,
}

#[derive(Debug)]
enum Scoring {
    Absolute(ExactAttention),
    Relative(RelPositionAttention),
    Banded(LocalRelPositionAttention),
}

impl Scoring {
    fn build(
        kind: &AttentionKind,
        relative: Option<RelativeParts>,
    ) -> Result<Self, AttentionError> {
        let relative_bias = |parts: Option<RelativeParts>| match parts {
            Some(parts) => RelPositionBias::new(parts.linear_pos, parts.bias),
            None => Err(AttentionError::config(
                "relative-position attention requires linear_pos and positional biases",
            )),
        };
        let scoring = match kind {
            AttentionKind::Absolute => Self::Absolute(ExactAttention::new()),
            AttentionKind::RelPosition => {
                Self::Relative(RelPositionAttention::new(relative_bias(relative)?))
            }
            AttentionKind::LocalRelPosition { att_context_size } => {
                let bias = relative_bias(relative)?;
                Self::Banded(LocalRelPositionAttention::new(bias, *att_context_size)?)
            }
        };
        Ok(scoring)
    }

    fn strategy(&self) -> &dyn Attention {
        match self {
            Scoring::Absolute(inner) => inner as &dyn Attention,
            Scoring::Relative(inner) => inner as &dyn Attention,
            Scoring::Banded(inner) => inner as &dyn Attention,
        }
    }

    fn relative_bias(&self) -> Option<&RelPositionBias> {
        match self {
            Scoring::Absolute(_) => None,
            Scoring::Relative(inner) => Some(inner.bias()),
            Scoring::Banded(inner) => Some(inner.bias()),
        }
    }
}

/// Multi-head attention with absolute, relative or banded relative scoring.
pub struct MultiHeadAttention {
    config: AttentionConfig,
    projections: Projections,
    scoring: Scoring,
    cache_id: Option<usize>,
    cache_drop_size: usize,
    training: bool,
    announced: OnceLock<()>,
}

impl fmt::Debug for MultiHeadAttention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiHeadAttention")
            .field("heads", &self.config.heads)
            .field("feature", &self.config.feature)
            .field("kind", &self.config.kind)
            .field("cache_id", &self.cache_id)
            .field("cache_drop_size", &self.cache_drop_size)
            .field("training", &self.training)
            .finish()
    }
}

impl MultiHeadAttention {
    /// Builds a layer with randomly initialised projections and zero
    /// positional biases.
    pub fn new(
        config: AttentionConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        config.validate()?;
        let bias = PositionBias::zeros(config.heads, config.head_dim(), dtype, device)?;
        Self::with_shared_bias(config, bias, device, dtype)
    }

    /// Like [`MultiHeadAttention::new`] but uses caller-provided biases, so
    /// several layers can share one `u`/`v` pair.
    pub fn with_shared_bias(
        config: AttentionConfig,
        bias: PositionBias,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        config.validate()?;
        let init = LinearInit::default();
        let projections = Projections::with_init(config.feature, &init, device, dtype)?;
        let relative = match config.kind {
            AttentionKind::Absolute => None,
            _ => Some(RelativeParts {
                linear_pos: Linear::with_init(
                    LinearConfig::without_bias(config.feature, config.feature),
                    &init,
                    device,
                    dtype,
                )?,
                bias,
            }),
        };
        Self::from_parts(config, projections, relative)
    }

    /// Assembles a layer from explicit weights.
    ///
    /// `relative` is required for the relative variants and ignored for
    /// absolute scoring.
    pub fn from_parts(
        config: AttentionConfig,
        projections: Projections,
        relative: Option<RelativeParts>,
    ) -> Result<Self, AttentionError> {
        config.validate()?;
        projections.validate(config.feature)?;
        if let Some(parts) = &relative {
            if parts.bias.heads() != config.heads || parts.bias.head_dim() != config.head_dim() {
                return Err(AttentionError::config(format!(
                    "positional biases are [{}, {}] but the layer has {} heads of width {}",
                    parts.bias.heads(),
                    parts.bias.head_dim(),
                    config.heads,
                    config.head_dim()
                )));
            }
        }
        let scoring = Scoring::build(&config.kind, relative)?;
        Ok(Self {
            config,
            projections,
            scoring,
            cache_id: None,
            cache_drop_size: 0,
            training: false,
            announced: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    pub fn projections(&self) -> &Projections {
        &self.projections
    }

    /// Positional biases of the relative variants.
    pub fn position_bias(&self) -> Option<&PositionBias> {
        self.scoring.relative_bias().map(RelPositionBias::position_bias)
    }

    pub fn cache_id(&self) -> Option<usize> {
        self.cache_id
    }

    /// Selects the cache slot this layer reads and writes.
    pub fn set_cache_id(&mut self, cache_id: Option<usize>) {
        self.cache_id = cache_id;
    }

    pub fn cache_drop_size(&self) -> usize {
        self.cache_drop_size
    }

    /// Number of newest query frames left out of the next cache state.
    pub fn set_cache_drop_size(&mut self, drop_size: usize) {
        self.cache_drop_size = drop_size;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Enables attention dropout (training) or disables it (inference).
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn policy_for(&self, dtype: DType) -> PrecisionPolicy {
        match self.config.precision {
            PrecisionMode::ForceF32 => PrecisionPolicy::from_parameter_dtype(dtype),
            PrecisionMode::Inherit => PrecisionPolicy::uniform(dtype),
        }
    }

    fn announce(&self, policy: &PrecisionPolicy) {
        self.announced.get_or_init(|| {
            log::info!(
                "attention init: heads={} head_dim={} kind={:?} cache={} precision={:?} upcast={}",
                self.config.heads,
                self.config.head_dim(),
                self.config.kind,
                self.config.max_cache_len,
                self.config.precision,
                policy.is_mixed_precision()
            );
        });
    }

    fn check_input(
        &self,
        name: &str,
        tensor: &Tensor,
        reference: &Tensor,
    ) -> Result<usize, AttentionError> {
        let (batch, time, feature) = tensor.dims3().map_err(|_| {
            AttentionError::shape(format!("{name} must have shape [batch, time, feature]"))
        })?;
        if feature != self.config.feature || batch != reference.dims()[0] {
            return Err(AttentionError::shape(format!(
                "{name} must be [{}, time, {}], got {:?}",
                reference.dims()[0],
                self.config.feature,
                tensor.dims()
            )));
        }
        if tensor.dtype() != reference.dtype() || !tensor.device().same_device(reference.device()) {
            return Err(AttentionError::shape(format!(
                "{name} must share dtype and device with query"
            )));
        }
        Ok(time)
    }

    fn split_heads(&self, tensor: &Tensor) -> Result<Tensor, AttentionError> {
        let (batch, time, _) = tensor.dims3()?;
        Ok(tensor
            .reshape((batch, time, self.config.heads, self.config.head_dim()))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    fn merge_heads(&self, tensor: &Tensor) -> Result<Tensor, AttentionError> {
        let (batch, _, time, _) = tensor.dims4()?;
        Ok(tensor
            .transpose(1, 2)?
            .reshape((batch, time, self.config.feature))?)
    }

    /// Attends `query` over `key`/`value`.
    ///
    /// * `query` is `(batch, time_q, feature)`, `key` and `value` are
    ///   `(batch, time_k, feature)`.
    /// * `mask` is `(batch, time_q, cache_len + time_k)` for absolute and
    ///   relative scoring and a key padding mask `(batch, cache_len + time_k)`
    ///   for banded scoring.
    /// * `pos_emb` is required by the relative variants: `2 * (cache_len +
    ///   time_k) - 1` offsets for full relative attention, `left + right + 1`
    ///   for banded attention.
    ///
    /// The next cache state is written only after the output was computed.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        pos_emb: Option<&Tensor>,
        mut cache: CacheAccess<'_>,
    ) -> Result<Tensor, AttentionError> {
        self.check_input("query", query, query)?;
        let k_len = self.check_input("key", key, query)?;
        let v_len = self.check_input("value", value, query)?;
        let policy = self.policy_for(query.dtype());
        self.announce(&policy);

        let (key, value, next_state) = match cache.current() {
            None => {
                if v_len != k_len {
                    return Err(AttentionError::shape(format!(
                        "key and value lengths differ: {k_len} vs {v_len}"
                    )));
                }
                (key.clone(), value.clone(), None)
            }
            Some(slots) => {
                let id = self.cache_id.ok_or(AttentionError::MissingCacheId)?;
                if self.config.max_cache_len == 0 {
                    return Err(AttentionError::config(
                        "a cache was supplied to a layer with max_cache_len = 0",
                    ));
                }
                if slots.capacity() > self.config.max_cache_len {
                    return Err(AttentionError::config(format!(
                        "cache capacity {} exceeds max_cache_len {}",
                        slots.capacity(),
                        self.config.max_cache_len
                    )));
                }
                if slots.batch() != query.dims()[0] || slots.feature() != self.config.feature {
                    return Err(AttentionError::shape(format!(
                        "cache slots are [batch {}, feature {}] but query is {:?}",
                        slots.batch(),
                        slots.feature(),
                        query.dims()
                    )));
                }
                let slot = slots.slot(id)?;
                let extended = Tensor::cat(&[&slot.to_dtype(key.dtype())?, key], 1)?;
                let next = if cache.writes() {
                    Some(next_cache_state(&slot, query, self.cache_drop_size)?)
                } else {
                    None
                };
                (extended.clone(), extended, next)
            }
        };

        let q = self.projections.linear_q.forward(query, &policy)?;
        let k = self.projections.linear_k.forward(&key, &policy)?;
        let v = self.projections.linear_v.forward(&value, &policy)?;
        let (q, k, v) = (
            self.split_heads(&q)?,
            self.split_heads(&k)?,
            self.split_heads(&v)?,
        );

        let runtime = Config::for_mode(self.config.dropout_p, self.training);
        let context = self
            .scoring
            .strategy()
            .attend(&q, &k, &v, mask, pos_emb, &runtime)?;
        let output = self
            .projections
            .linear_out
            .forward(&self.merge_heads(&context)?, &policy)?;
        let output = policy.cast_to_storage(&output)?;

        if let (Some(next), Some(target)) = (next_state, cache.target()) {
            if let Some(id) = self.cache_id {
                log::debug!(
                    "cache commit: slot={id} keep={} capacity={}",
                    query.dims()[1].saturating_sub(self.cache_drop_size),
                    target.capacity()
                );
                target.write_slot(id, &next)?;
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_cache::CacheSlots;
    use static_assertions::assert_impl_all;

    assert_impl_all!(MultiHeadAttention: Send, Sync);

    fn local_config(left: i64, right: i64) -> AttentionConfig {
        AttentionConfig::new(
            2,
            8,
            AttentionKind::LocalRelPosition {
                att_context_size: [left, right],
            },
        )
    }

    #[test]
    fn zero_window_fails_at_construction() {
        let err =
            MultiHeadAttention::new(local_config(0, 0), &Device::Cpu, DType::F32).unwrap_err();
        assert!(matches!(err, AttentionError::InvalidConfig { .. }));
    }

    #[test]
    fn half_inputs_are_upcast_only_when_forced() {
        let device = Device::Cpu;
        let mut config = AttentionConfig::new(2, 8, AttentionKind::Absolute);
        let forced = MultiHeadAttention::new(config.clone(), &device, DType::F32).unwrap();
        assert!(forced.policy_for(DType::F16).is_mixed_precision());
        assert!(!forced.policy_for(DType::F32).is_mixed_precision());

        config.precision = PrecisionMode::Inherit;
        let inherit = MultiHeadAttention::new(config, &device, DType::F32).unwrap();
        assert!(!inherit.policy_for(DType::BF16).is_mixed_precision());
        assert_eq!(inherit.policy_for(DType::BF16).compute(), DType::BF16);
    }

    #[test]
    fn relative_kinds_require_relative_parts() {
        let device = Device::Cpu;
        let config = AttentionConfig::new(2, 8, AttentionKind::RelPosition);
        let projections =
            Projections::with_init(8, &LinearInit::default(), &device, DType::F32).unwrap();
        let err = MultiHeadAttention::from_parts(config, projections.clone(), None).unwrap_err();
        assert!(matches!(err, AttentionError::InvalidConfig { .. }));

        let absolute = AttentionConfig::new(2, 8, AttentionKind::Absolute);
        let layer = MultiHeadAttention::from_parts(absolute, projections, None).unwrap();
        assert!(layer.position_bias().is_none());
    }

    #[test]
    fn shared_bias_is_reused() {
        let device = Device::Cpu;
        let bias = PositionBias::new(
            Tensor::ones((2, 4), DType::F32, &device).unwrap(),
            Tensor::zeros((2, 4), DType::F32, &device).unwrap(),
        )
        .unwrap();
        let config = AttentionConfig::new(2, 8, AttentionKind::RelPosition);
        let first =
            MultiHeadAttention::with_shared_bias(config.clone(), bias.clone(), &device, DType::F32)
                .unwrap();
        let second =
            MultiHeadAttention::with_shared_bias(config, bias, &device, DType::F32).unwrap();
        let read = |layer: &MultiHeadAttention| {
            layer.position_bias().unwrap().u.to_vec2::<f32>().unwrap()
        };
        assert_eq!(read(&first), read(&second));
        assert_eq!(read(&first)[0], vec![1.0; 4]);
    }

    #[test]
    fn cache_requires_slot_and_capacity() {
        let device = Device::Cpu;
        let mut config = AttentionConfig::new(2, 8, AttentionKind::Absolute);
        config.max_cache_len = 4;
        let mut layer = MultiHeadAttention::new(config, &device, DType::F32).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 3, 8), &device).unwrap();
        let slots = CacheSlots::zeros(2, 1, 4, 8, DType::F32, &device).unwrap();

        let err = layer
            .forward(&x, &x, &x, None, None, CacheAccess::Read(&slots))
            .unwrap_err();
        assert!(matches!(err, AttentionError::MissingCacheId));

        layer.set_cache_id(Some(5));
        let err = layer
            .forward(&x, &x, &x, None, None, CacheAccess::Read(&slots))
            .unwrap_err();
        assert!(matches!(
            err,
            AttentionError::CacheSlotOutOfRange { id: 5, slots: 2 }
        ));

        layer.set_cache_id(Some(1));
        let big = CacheSlots::zeros(2, 1, 8, 8, DType::F32, &device).unwrap();
        let err = layer
            .forward(&x, &x, &x, None, None, CacheAccess::Read(&big))
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidConfig { .. }));
    }

    #[test]
    fn in_place_cache_updates_only_the_assigned_slot() {
        let device = Device::Cpu;
        let mut config = AttentionConfig::new(2, 8, AttentionKind::Absolute);
        config.max_cache_len = 4;
        let mut layer = MultiHeadAttention::new(config, &device, DType::F32).unwrap();
        layer.set_cache_id(Some(0));
        layer.set_cache_drop_size(1);

        let x = Tensor::randn(0f32, 1.0, (1, 3, 8), &device).unwrap();
        let mut slots = CacheSlots::zeros(2, 1, 4, 8, DType::F32, &device).unwrap();
        let out = layer
            .forward(&x, &x, &x, None, None, CacheAccess::InPlace(&mut slots))
            .unwrap();
        assert_eq!(out.dims(), &[1, 3, 8]);

        let slot = slots
            .slot(0)
            .unwrap()
            .squeeze(0)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        let frames = x.squeeze(0).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(slot[0], vec![0.0; 8]);
        assert_eq!(slot[1], vec![0.0; 8]);
        assert_eq!(slot[2], frames[0]);
        assert_eq!(slot[3], frames[1]);

        let untouched = slots
            .slot(1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(untouched.iter().all(|value| *value == 0.0));
    }

    #[test]
    fn half_precision_inputs_keep_their_dtype() {
        let device = Device::Cpu;
        let layer = MultiHeadAttention::new(local_config(2, 2), &device, DType::F32).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 5, 8), &device)
            .unwrap()
            .to_dtype(DType::F16)
            .unwrap();
        let pos = Tensor::randn(0f32, 1.0, (1, 5, 8), &device)
            .unwrap()
            .to_dtype(DType::F16)
            .unwrap();
        let out = layer
            .forward(&x, &x, &x, None, Some(&pos), CacheAccess::None)
            .unwrap();
        assert_eq!(out.dtype(), DType::F16);
        let values = out
            .to_dtype(DType::F32)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(values.iter().all(|value| value.is_finite()));
    }

    #[test]
    fn mismatched_inputs_are_rejected() {
        let device = Device::Cpu;
        let config = AttentionConfig::new(2, 8, AttentionKind::Absolute);
        let layer = MultiHeadAttention::new(config, &device, DType::F32).unwrap();
        let q = Tensor::zeros((1, 3, 8), DType::F32, &device).unwrap();
        let narrow = Tensor::zeros((1, 3, 6), DType::F32, &device).unwrap();
        let err = layer
            .forward(&q, &narrow, &narrow, None, None, CacheAccess::None)
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));

        let short_v = Tensor::zeros((1, 2, 8), DType::F32, &device).unwrap();
        assert!(layer
            .forward(&q, &q, &short_v, None, None, CacheAccess::None)
            .is_err());
    }
}
