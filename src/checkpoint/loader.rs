//! Copying state dict entries into model variables

use std::collections::HashSet;

use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use tracing::debug;

use super::format::StateDict;
use crate::error::{NasError, Result};

/// Batch-norm buffers the model does not keep
const IGNORED_SUFFIXES: &[&str] = &["num_batches_tracked"];

/// Outcome of loading a state dict
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Keys copied into the model
    pub loaded: Vec<String>,
    /// Model parameters absent from the state dict
    pub missing: Vec<String>,
    /// State dict entries with no matching parameter
    pub unexpected: Vec<String>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

fn is_ignored(key: &str) -> bool {
    IGNORED_SUFFIXES
        .iter()
        .any(|suffix| key == *suffix || key.ends_with(&format!(".{}", suffix)))
}

/// Entries under `block.`, with that prefix removed
pub fn select_block(dict: &StateDict, block: &str) -> StateDict {
    let prefix = format!("{}.", block);
    dict.iter()
        .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|local| (local.to_string(), v.clone())))
        .collect()
}

/// Snapshot of every variable in `varmap`
pub fn state_dict(varmap: &VarMap) -> Result<StateDict> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| NasError::CheckpointError("variable map lock poisoned".to_string()))?;
    Ok(vars
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect())
}

/// Copy `dict` into the variables of `varmap`.
///
/// With `scope` set only variables named `scope.<key>` take part and are
/// matched against `<key>`. Shape mismatches always fail; `strict` also fails
/// on missing or unexpected keys. Nothing is written when an error is returned.
pub fn load_into(
    varmap: &VarMap,
    dict: &StateDict,
    scope: Option<&str>,
    strict: bool,
) -> Result<LoadReport> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| NasError::CheckpointError("variable map lock poisoned".to_string()))?;

    let scoped: Vec<(String, &Var)> = vars
        .iter()
        .filter_map(|(name, var)| match scope {
            Some(scope) => name
                .strip_prefix(scope)
                .and_then(|rest| rest.strip_prefix('.'))
                .map(|local| (local.to_string(), var)),
            None => Some((name.clone(), var)),
        })
        .collect();

    let mut report = LoadReport::default();
    let mut updates: Vec<(&Var, &Tensor)> = Vec::new();
    for (local, var) in &scoped {
        match dict.get(local) {
            Some(tensor) => {
                if tensor.dims() != var.dims() {
                    return Err(NasError::ShapeError {
                        name: qualified(scope, local),
                        expected: format!("{:?}", var.dims()),
                        actual: format!("{:?}", tensor.dims()),
                    });
                }
                updates.push((*var, tensor));
                report.loaded.push(local.clone());
            }
            None => report.missing.push(local.clone()),
        }
    }

    let known: HashSet<&str> = scoped.iter().map(|(local, _)| local.as_str()).collect();
    report.unexpected = dict
        .keys()
        .filter(|k| !known.contains(k.as_str()) && !is_ignored(k))
        .cloned()
        .collect();

    report.loaded.sort();
    report.missing.sort();

    if strict {
        if !report.missing.is_empty() {
            return Err(NasError::MissingKeys(report.missing));
        }
        if !report.unexpected.is_empty() {
            return Err(NasError::UnexpectedKeys(report.unexpected));
        }
    }

    for (var, tensor) in updates {
        let value = tensor.to_device(var.device())?.to_dtype(var.dtype())?;
        var.set(&value)?;
    }

    debug!(
        scope = scope.unwrap_or("<root>"),
        strict,
        loaded = report.loaded.len(),
        missing = report.missing.len(),
        unexpected = report.unexpected.len(),
        "Loaded state dict"
    );
    Ok(report)
}

fn qualified(scope: Option<&str>, local: &str) -> String {
    match scope {
        Some(scope) => format!("{}.{}", scope, local),
        None => local.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    fn varmap_with(names: &[&str]) -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        for name in names {
            vb.get_with_hints(2, name, Init::Const(0.0)).unwrap();
        }
        varmap
    }

    fn tensor(values: [f32; 2]) -> Tensor {
        Tensor::new(&values, &Device::Cpu).unwrap()
    }

    fn value(varmap: &VarMap, name: &str) -> Vec<f32> {
        let vars = varmap.data().lock().unwrap();
        vars[name].as_tensor().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_select_block_strips_prefix() {
        let mut dict = StateDict::new();
        dict.insert("layer1.0.conv1.weight".to_string(), tensor([1.0, 1.0]));
        dict.insert("layer10.weight".to_string(), tensor([1.0, 1.0]));
        dict.insert("fc.weight".to_string(), tensor([2.0, 2.0]));
        dict.insert("fc.bias".to_string(), tensor([3.0, 3.0]));

        let fc = select_block(&dict, "fc");
        assert_eq!(fc.keys().collect::<Vec<_>>(), vec!["bias", "weight"]);

        let layer1 = select_block(&dict, "layer1");
        assert_eq!(layer1.keys().collect::<Vec<_>>(), vec!["0.conv1.weight"]);
    }

    #[test]
    fn test_non_strict_load_reports_keys() {
        let varmap = varmap_with(&["a.weight", "a.bias"]);
        let mut dict = StateDict::new();
        dict.insert("a.weight".to_string(), tensor([1.0, 2.0]));
        dict.insert("b.weight".to_string(), tensor([5.0, 5.0]));
        dict.insert("a.num_batches_tracked".to_string(), tensor([0.0, 0.0]));

        let report = load_into(&varmap, &dict, None, false).unwrap();
        assert_eq!(report.loaded, vec!["a.weight"]);
        assert_eq!(report.missing, vec!["a.bias"]);
        assert_eq!(report.unexpected, vec!["b.weight"]);
        assert!(!report.is_complete());
        assert_eq!(value(&varmap, "a.weight"), vec![1.0, 2.0]);
    }

    #[test]
    fn test_strict_load_fails_without_writing() {
        let varmap = varmap_with(&["a.weight", "a.bias"]);
        let mut dict = StateDict::new();
        dict.insert("a.weight".to_string(), tensor([1.0, 2.0]));

        let result = load_into(&varmap, &dict, None, true);
        assert!(matches!(result, Err(NasError::MissingKeys(_))));
        assert_eq!(value(&varmap, "a.weight"), vec![0.0, 0.0]);

        dict.insert("a.bias".to_string(), tensor([3.0, 4.0]));
        dict.insert("extra".to_string(), tensor([0.0, 0.0]));
        let result = load_into(&varmap, &dict, None, true);
        assert!(matches!(result, Err(NasError::UnexpectedKeys(_))));
    }

    #[test]
    fn test_scoped_load() {
        let varmap = varmap_with(&["fc.weight", "fc.bias", "conv1.weight"]);
        let mut dict = StateDict::new();
        dict.insert("weight".to_string(), tensor([7.0, 8.0]));
        dict.insert("bias".to_string(), tensor([9.0, 9.0]));

        let report = load_into(&varmap, &dict, Some("fc"), true).unwrap();
        assert!(report.is_complete());
        assert_eq!(value(&varmap, "fc.weight"), vec![7.0, 8.0]);
        assert_eq!(value(&varmap, "fc.bias"), vec![9.0, 9.0]);
        assert_eq!(value(&varmap, "conv1.weight"), vec![0.0, 0.0]);
    }

    #[test]
    fn test_shape_mismatch_is_an_error() {
        let varmap = varmap_with(&["w"]);
        let mut dict = StateDict::new();
        dict.insert("w".to_string(), Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap());
        let result = load_into(&varmap, &dict, None, false);
        assert!(matches!(result, Err(NasError::ShapeError { .. })));
    }

    #[test]
    fn test_state_dict_snapshot() {
        let varmap = varmap_with(&["x", "y"]);
        let dict = state_dict(&varmap).unwrap();
        assert_eq!(dict.keys().collect::<Vec<_>>(), vec!["x", "y"]);
    }
}
