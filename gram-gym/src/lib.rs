//! Bridge to a batched Python simulator.
//!
//! The Python side is any object exposing
//! `num_envs`, `num_obs`, `num_actions`, `num_joints`, `max_episode_length`,
//! `reset() -> obs`, `step(actions) -> (obs, rewards, terminated, truncated)`,
//! `get_contexts() -> list[dict]` and `set_contexts(env_ids, contexts)`, and optionally
//! `set_terrain(roughness_cm, slope_degrees)`. Observations and actions cross the boundary as
//! nested lists of floats.

use candle_core::{Device, Tensor};
use gram_core::{
    GramError, Result,
    context::Context,
    env::{EnvironmentDescription, StepResult, TerrainSettings, VecEnv},
};
use pyo3::{
    Bound, PyAny, PyErr, PyObject, PyResult, Python,
    types::{PyAnyMethods, PyDict, PyDictMethods},
};

fn py_err(err: PyErr) -> GramError {
    GramError::Environment(format!("python: {err}"))
}

/// Flattens `rows` into a `[rows.len(), width]` tensor.
fn rows_to_tensor(rows: Vec<Vec<f32>>, width: usize, device: &Device) -> Result<Tensor> {
    let num_rows = rows.len();
    if let Some(row) = rows.iter().find(|row| row.len() != width) {
        return Err(GramError::Environment(format!(
            "malformed batch: expected rows of {width} values, got {}",
            row.len()
        )));
    }
    let flat: Vec<f32> = rows.into_iter().flatten().collect();
    Ok(Tensor::from_vec(flat, (num_rows, width), device)?)
}

fn context_to_dict<'py>(py: Python<'py>, context: &Context) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    dict.set_item("added_mass", context.added_mass)?;
    dict.set_item("friction_mult", context.friction_mult)?;
    dict.set_item("motor_strength_mult", context.motor_strength_mult)?;
    dict.set_item("joint_bias", context.joint_bias)?;
    dict.set_item("frozen_joint", context.frozen_joint)?;
    Ok(dict)
}

fn context_from_py(item: &Bound<'_, PyAny>) -> PyResult<Context> {
    Ok(Context {
        added_mass: item.get_item("added_mass")?.extract()?,
        friction_mult: item.get_item("friction_mult")?.extract()?,
        motor_strength_mult: item.get_item("motor_strength_mult")?.extract()?,
        joint_bias: item.get_item("joint_bias")?.extract()?,
        frozen_joint: item.get_item("frozen_joint")?.extract()?,
    })
}

pub struct PyVecEnv {
    env: PyObject,
    num_envs: usize,
    description: EnvironmentDescription,
    supports_terrain: bool,
    device: Device,
}

impl PyVecEnv {
    /// Calls `module.factory(num_envs=num_envs)` and wraps the returned simulator.
    pub fn new(module: &str, factory: &str, num_envs: usize, device: &Device) -> Result<Self> {
        let env = Python::with_gil(|py| -> PyResult<PyObject> {
            let module = py.import(module)?;
            let kwargs = PyDict::new(py);
            kwargs.set_item("num_envs", num_envs)?;
            let env = module.getattr(factory)?.call((), Some(&kwargs))?;
            Ok(env.unbind())
        })
        .map_err(py_err)?;
        Self::from_object(env, device)
    }

    pub fn from_object(env: PyObject, device: &Device) -> Result<Self> {
        let (num_envs, description, supports_terrain) = Python::with_gil(|py| {
            let bound = env.bind(py);
            let num_envs: usize = bound.getattr("num_envs")?.extract()?;
            let description = EnvironmentDescription {
                observation_size: bound.getattr("num_obs")?.extract()?,
                action_size: bound.getattr("num_actions")?.extract()?,
                num_joints: bound.getattr("num_joints")?.extract()?,
                max_episode_length: bound.getattr("max_episode_length")?.extract()?,
            };
            let supports_terrain = bound.hasattr("set_terrain")?;
            PyResult::Ok((num_envs, description, supports_terrain))
        })
        .map_err(py_err)?;
        Ok(Self {
            env,
            num_envs,
            description,
            supports_terrain,
            device: device.clone(),
        })
    }

    fn observations(&self, rows: Vec<Vec<f32>>) -> Result<Tensor> {
        if rows.len() != self.num_envs {
            return Err(GramError::Environment(format!(
                "expected observations for {} instances, got {}",
                self.num_envs,
                rows.len()
            )));
        }
        rows_to_tensor(rows, self.description.observation_size, &self.device)
    }
}

impl VecEnv for PyVecEnv {
    fn num_envs(&self) -> usize {
        self.num_envs
    }

    fn env_description(&self) -> EnvironmentDescription {
        self.description
    }

    fn reset(&mut self) -> Result<Tensor> {
        let rows: Vec<Vec<f32>> = Python::with_gil(|py| {
            self.env.call_method0(py, "reset")?.extract(py)
        })
        .map_err(py_err)?;
        self.observations(rows)
    }

    fn step(&mut self, actions: &Tensor) -> Result<StepResult> {
        let actions: Vec<Vec<f32>> = actions.to_vec2()?;
        let (rows, rewards, terminated, truncated) = Python::with_gil(|py| {
            let step = self.env.call_method1(py, "step", (actions,))?;
            let step = step.bind(py);
            let rows: Vec<Vec<f32>> = step.get_item(0)?.extract()?;
            let rewards: Vec<f32> = step.get_item(1)?.extract()?;
            let terminated: Vec<bool> = step.get_item(2)?.extract()?;
            let truncated: Vec<bool> = step.get_item(3)?.extract()?;
            PyResult::Ok((rows, rewards, terminated, truncated))
        })
        .map_err(py_err)?;
        Ok(StepResult {
            observations: self.observations(rows)?,
            rewards,
            terminated,
            truncated,
        })
    }

    fn contexts(&self) -> Result<Vec<Context>> {
        Python::with_gil(|py| {
            let contexts = self.env.call_method0(py, "get_contexts")?;
            contexts
                .bind(py)
                .try_iter()?
                .map(|item| context_from_py(&item?))
                .collect::<PyResult<Vec<_>>>()
        })
        .map_err(py_err)
    }

    fn set_contexts(&mut self, env_ids: &[usize], contexts: &[Context]) -> Result<()> {
        if env_ids.len() != contexts.len() {
            return Err(GramError::ShapeMismatch {
                what: "context assignment",
                expected: vec![env_ids.len()],
                actual: vec![contexts.len()],
            });
        }
        Python::with_gil(|py| {
            let dicts = contexts
                .iter()
                .map(|context| context_to_dict(py, context))
                .collect::<PyResult<Vec<_>>>()?;
            self.env
                .call_method1(py, "set_contexts", (env_ids.to_vec(), dicts))?;
            PyResult::Ok(())
        })
        .map_err(py_err)
    }

    fn set_terrain(&mut self, terrain: TerrainSettings) -> Result<()> {
        if !self.supports_terrain {
            return if terrain.is_flat() {
                Ok(())
            } else {
                Err(GramError::Environment(
                    "simulator does not expose set_terrain".to_owned(),
                ))
            };
        }
        Python::with_gil(|py| {
            self.env.call_method1(
                py,
                "set_terrain",
                (terrain.roughness_cm, terrain.slope_degrees),
            )?;
            PyResult::Ok(())
        })
        .map_err(py_err)
    }
}
