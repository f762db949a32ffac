//! Named parameter state of a fitted model.
//!
//! Every learnable or fixed tensor lives in one candle `VarMap` under a
//! dotted name (`warp.0.q_mu`, `outcome.kernel.ln_lengthscale`, ...).
//! Frozen names stay in the map, so they are saved and loaded, but are
//! never handed to the optimizer.

use crate::error::{AlignError, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

pub struct ParamStore {
    varmap: VarMap,
    frozen: HashSet<String>,
    dtype: DType,
    device: Device,
}

impl ParamStore {
    pub fn new(dtype: DType, device: &Device) -> Self {
        Self {
            varmap: VarMap::new(),
            frozen: HashSet::new(),
            dtype,
            device: device.clone(),
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Builder that creates trainable variables in this store
    pub fn var_builder(&self) -> VarBuilder<'static> {
        VarBuilder::from_varmap(&self.varmap, self.dtype, &self.device)
    }

    /// Register `value` under `name` and return the tracked tensor
    pub fn insert(&mut self, name: &str, value: &Tensor, trainable: bool) -> Result<Tensor> {
        let value = value.to_dtype(self.dtype)?.to_device(&self.device)?;
        let var = Var::from_tensor(&value)?;
        let tensor = var.as_tensor().clone();

        {
            let mut data = self.varmap.data().lock().map_err(|_| AlignError::Poisoned)?;
            if data.contains_key(name) {
                return Err(AlignError::Config(format!("duplicate parameter {}", name)));
            }
            data.insert(name.to_string(), var);
        }

        if !trainable {
            self.frozen.insert(name.to_string());
        }
        Ok(tensor)
    }

    pub fn is_trainable(&self, name: &str) -> bool {
        !self.frozen.contains(name)
    }

    /// Variables handed to the optimizer, in name order
    pub fn trainable_vars(&self) -> Result<Vec<Var>> {
        let data = self.varmap.data().lock().map_err(|_| AlignError::Poisoned)?;
        let mut named: Vec<(&String, &Var)> = data
            .iter()
            .filter(|(name, _)| !self.frozen.contains(name.as_str()))
            .collect();
        named.sort_by(|a, b| a.0.cmp(b.0));
        Ok(named.into_iter().map(|(_, v)| v.clone()).collect())
    }

    /// Copy of every parameter; later updates do not show through
    pub fn named_tensors(&self) -> Result<BTreeMap<String, Tensor>> {
        let data = self.varmap.data().lock().map_err(|_| AlignError::Poisoned)?;
        data.iter()
            .map(|(name, var)| -> Result<(String, Tensor)> {
                Ok((name.clone(), var.as_tensor().detach().copy()?))
            })
            .collect()
    }

    pub fn num_scalars(&self) -> Result<usize> {
        let data = self.varmap.data().lock().map_err(|_| AlignError::Poisoned)?;
        Ok(data.values().map(|v| v.as_tensor().elem_count()).sum())
    }

    /// safetensors file with every parameter
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.varmap.save(path)?;
        Ok(())
    }

    /// Overwrite parameter values in place; names and shapes must match
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.varmap.load(path)?;
        Ok(())
    }
}
