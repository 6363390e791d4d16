//! Environment dynamics parameters ("contexts") and the ranges they are drawn from.
//!
//! A [`Context`] is the ground-truth description of one instance's dynamics. In-distribution
//! contexts are sampled uniformly from a [`ContextRanges`]; the adversary instead picks a point
//! inside the out-of-distribution ranges through [`ContextRanges::from_deltas`].

use crate::error::{GramError, Result};
use candle_core::{Device, Tensor};
use rand::{Rng, seq::IndexedRandom};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Number of continuous dynamics parameters in a [`Context`].
pub const NUM_CONTINUOUS_PARAMS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContextRange {
    pub min: f32,
    pub max: f32,
}

impl ContextRange {
    pub fn new(name: &str, min: f32, max: f32) -> Result<Self> {
        let range = Self { min, max };
        range.validate(name)?;
        Ok(range)
    }

    pub const fn fixed(value: f32) -> Self {
        Self {
            min: value,
            max: value,
        }
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if !self.min.is_finite() || !self.max.is_finite() || self.min > self.max {
            return Err(GramError::InvalidRange {
                name: name.to_owned(),
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }

    pub fn sample(&self, rng: &mut impl Rng) -> f32 {
        if self.min == self.max {
            self.min
        } else {
            rng.random_range(self.min..=self.max)
        }
    }

    pub fn center(&self) -> f32 {
        0.5 * (self.min + self.max)
    }

    pub fn half_width(&self) -> f32 {
        0.5 * (self.max - self.min)
    }

    pub fn contains(&self, value: f32) -> bool {
        self.min <= value && value <= self.max
    }

    /// Maps `value` to `[-1, 1]` relative to this range. Degenerate ranges map to 0.
    pub fn normalize(&self, value: f32) -> f32 {
        let half_width = self.half_width();
        if half_width == 0. {
            0.
        } else {
            (value - self.center()) / half_width
        }
    }

    /// Inverse of [`ContextRange::normalize`], clamping `delta` so the result stays in range.
    pub fn denormalize(&self, delta: f32) -> f32 {
        let value = self.center() + delta.clamp(-1., 1.) * self.half_width();
        value.clamp(self.min, self.max)
    }
}

/// Which joint, if any, gets frozen (motor fault) in a sampled context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrozenJointMode {
    #[default]
    None,
    /// Uniform over "no fault" and every joint.
    Any,
    /// Always one of the listed joints.
    Joints(Vec<usize>),
}

impl FrozenJointMode {
    pub fn sample(&self, rng: &mut impl Rng, num_joints: usize) -> Option<usize> {
        match self {
            Self::None => None,
            Self::Any => {
                let choice = rng.random_range(0..=num_joints);
                (choice < num_joints).then_some(choice)
            }
            Self::Joints(joints) => joints.choose(rng).copied(),
        }
    }

    pub fn validate(&self, num_joints: usize) -> Result<()> {
        match self {
            Self::Joints(joints) if joints.is_empty() => Err(GramError::Config(
                "frozen joint mode lists no joints".to_owned(),
            )),
            Self::Joints(joints) => match joints.iter().find(|j| **j >= num_joints) {
                Some(joint) => Err(GramError::Config(format!(
                    "frozen joint {joint} out of range for {num_joints} joints"
                ))),
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }
}

impl FromStr for FrozenJointMode {
    type Err = GramError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "any" => Ok(Self::Any),
            joints => joints
                .split(',')
                .map(|j| j.trim().parse::<usize>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Self::Joints)
                .map_err(|_| GramError::Config(format!("invalid frozen joint mode `{s}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    /// Mass added to the base, in kg.
    pub added_mass: f32,
    pub friction_mult: f32,
    pub motor_strength_mult: f32,
    /// Offset added to every joint position target, in rad.
    pub joint_bias: f32,
    pub frozen_joint: Option<usize>,
}

impl Default for Context {
    fn default() -> Self {
        Self::nominal()
    }
}

impl Context {
    pub const fn nominal() -> Self {
        Self {
            added_mass: 0.,
            friction_mult: 1.,
            motor_strength_mult: 1.,
            joint_bias: 0.,
            frozen_joint: None,
        }
    }

    pub fn continuous(&self) -> [f32; NUM_CONTINUOUS_PARAMS] {
        [
            self.added_mass,
            self.friction_mult,
            self.motor_strength_mult,
            self.joint_bias,
        ]
    }

    pub fn feature_size(num_joints: usize) -> usize {
        NUM_CONTINUOUS_PARAMS + num_joints
    }

    /// Continuous parameters followed by a one-hot encoding of the frozen joint.
    pub fn features(&self, num_joints: usize) -> Vec<f32> {
        let mut features = Vec::with_capacity(Self::feature_size(num_joints));
        features.extend_from_slice(&self.continuous());
        features.extend((0..num_joints).map(|joint| {
            if self.frozen_joint == Some(joint) {
                1.
            } else {
                0.
            }
        }));
        features
    }
}

/// Stacks the feature vectors of `contexts` into a `[contexts.len(), feature_size]` tensor.
pub fn contexts_to_tensor(contexts: &[Context], num_joints: usize, device: &Device) -> Result<Tensor> {
    let features: Vec<f32> = contexts
        .iter()
        .flat_map(|context| context.features(num_joints))
        .collect();
    let tensor = Tensor::from_vec(
        features,
        (contexts.len(), Context::feature_size(num_joints)),
        device,
    )?;
    Ok(tensor)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRanges {
    pub added_mass: ContextRange,
    pub friction_mult: ContextRange,
    pub motor_strength_mult: ContextRange,
    pub joint_bias: ContextRange,
    #[serde(default)]
    pub frozen_joint: FrozenJointMode,
}

impl Default for ContextRanges {
    fn default() -> Self {
        Self::in_distribution()
    }
}

impl ContextRanges {
    pub fn nominal() -> Self {
        Self {
            added_mass: ContextRange::fixed(0.),
            friction_mult: ContextRange::fixed(1.),
            motor_strength_mult: ContextRange::fixed(1.),
            joint_bias: ContextRange::fixed(0.),
            frozen_joint: FrozenJointMode::None,
        }
    }

    pub fn in_distribution() -> Self {
        Self {
            added_mass: ContextRange { min: -1., max: 3. },
            friction_mult: ContextRange { min: 0.5, max: 1.25 },
            motor_strength_mult: ContextRange { min: 0.9, max: 1.1 },
            joint_bias: ContextRange {
                min: -0.05,
                max: 0.05,
            },
            frozen_joint: FrozenJointMode::None,
        }
    }

    pub fn wide() -> Self {
        Self {
            added_mass: ContextRange { min: -2., max: 6. },
            friction_mult: ContextRange {
                min: 0.25,
                max: 1.75,
            },
            motor_strength_mult: ContextRange { min: 0.8, max: 1.2 },
            joint_bias: ContextRange { min: -0.1, max: 0.1 },
            frozen_joint: FrozenJointMode::None,
        }
    }

    /// Bounds for adversarially chosen contexts.
    pub fn out_of_distribution() -> Self {
        Self {
            added_mass: ContextRange { min: -3., max: 9. },
            friction_mult: ContextRange { min: 0.1, max: 2.5 },
            motor_strength_mult: ContextRange { min: 0.5, max: 1.5 },
            joint_bias: ContextRange { min: -0.2, max: 0.2 },
            frozen_joint: FrozenJointMode::Any,
        }
    }

    fn continuous_ranges(&self) -> [(&'static str, &ContextRange); NUM_CONTINUOUS_PARAMS] {
        [
            ("added_mass", &self.added_mass),
            ("friction_mult", &self.friction_mult),
            ("motor_strength_mult", &self.motor_strength_mult),
            ("joint_bias", &self.joint_bias),
        ]
    }

    pub fn validate(&self, num_joints: usize) -> Result<()> {
        for (name, range) in self.continuous_ranges() {
            range.validate(name)?;
        }
        self.frozen_joint.validate(num_joints)
    }

    pub fn sample(&self, rng: &mut impl Rng, num_joints: usize) -> Context {
        Context {
            added_mass: self.added_mass.sample(rng),
            friction_mult: self.friction_mult.sample(rng),
            motor_strength_mult: self.motor_strength_mult.sample(rng),
            joint_bias: self.joint_bias.sample(rng),
            frozen_joint: self.frozen_joint.sample(rng, num_joints),
        }
    }

    pub fn contains(&self, context: &Context) -> bool {
        self.continuous_ranges()
            .iter()
            .zip(context.continuous())
            .all(|((_, range), value)| range.contains(value))
    }

    /// Continuous parameters of `context` mapped to `[-1, 1]` relative to these ranges.
    pub fn normalize(&self, context: &Context) -> [f32; NUM_CONTINUOUS_PARAMS] {
        let mut normalized = [0.; NUM_CONTINUOUS_PARAMS];
        for (idx, ((_, range), value)) in self
            .continuous_ranges()
            .iter()
            .zip(context.continuous())
            .enumerate()
        {
            normalized[idx] = range.normalize(value);
        }
        normalized
    }

    /// Builds a context from normalized deltas, one per continuous parameter. The result always
    /// lies inside these ranges; the frozen joint is drawn from the frozen joint mode.
    pub fn from_deltas(&self, deltas: &[f32], rng: &mut impl Rng, num_joints: usize) -> Result<Context> {
        let [mass, friction, motor, bias] = deltas else {
            return Err(GramError::ShapeMismatch {
                what: "context deltas",
                expected: vec![NUM_CONTINUOUS_PARAMS],
                actual: vec![deltas.len()],
            });
        };
        Ok(Context {
            added_mass: self.added_mass.denormalize(*mass),
            friction_mult: self.friction_mult.denormalize(*friction),
            motor_strength_mult: self.motor_strength_mult.denormalize(*motor),
            joint_bias: self.joint_bias.denormalize(*bias),
            frozen_joint: self.frozen_joint.sample(rng, num_joints),
        })
    }
}

/// Named in-distribution context sets used for training.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdContextSet {
    Nominal,
    #[default]
    Default,
    Wide,
}

impl IdContextSet {
    pub fn ranges(&self) -> ContextRanges {
        match self {
            Self::Nominal => ContextRanges::nominal(),
            Self::Default => ContextRanges::in_distribution(),
            Self::Wide => ContextRanges::wide(),
        }
    }
}

impl FromStr for IdContextSet {
    type Err = GramError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "nominal" => Ok(Self::Nominal),
            "default" => Ok(Self::Default),
            "wide" => Ok(Self::Wide),
            other => Err(GramError::Config(format!(
                "unknown id context set `{other}`, expected nominal, default or wide"
            ))),
        }
    }
}

/// Per-parameter replacements applied on top of a base set of ranges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextOverrides {
    pub added_mass: Option<ContextRange>,
    pub friction_mult: Option<ContextRange>,
    pub motor_strength_mult: Option<ContextRange>,
    pub joint_bias: Option<ContextRange>,
    pub frozen_joint: Option<FrozenJointMode>,
}

impl ContextOverrides {
    pub fn apply(&self, base: &ContextRanges) -> ContextRanges {
        ContextRanges {
            added_mass: self.added_mass.unwrap_or(base.added_mass),
            friction_mult: self.friction_mult.unwrap_or(base.friction_mult),
            motor_strength_mult: self
                .motor_strength_mult
                .unwrap_or(base.motor_strength_mult),
            joint_bias: self.joint_bias.unwrap_or(base.joint_bias),
            frozen_joint: self
                .frozen_joint
                .clone()
                .unwrap_or_else(|| base.frozen_joint.clone()),
        }
    }
}
