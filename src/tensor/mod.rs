//! Named, shaped, typed tensors exchanged with the engine.

pub mod dtype;

use std::collections::HashMap;

use serde_json::{json, Value};

pub use dtype::{DataType, Layout};

use crate::error::{BridgeError, Result};

/// Input or output tensors keyed by name.
pub type TensorMap = HashMap<String, Tensor>;

/// Tensor payload, one variant per storage layout.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Int(Vec<i64>),
    Float(Vec<f64>),
    Bool(Vec<bool>),
    Str(Vec<String>),
    Json(Value),
}

impl TensorData {
    fn kind(&self) -> &'static str {
        match self {
            TensorData::Int(_) => "int buffer",
            TensorData::Float(_) => "float buffer",
            TensorData::Bool(_) => "bool buffer",
            TensorData::Str(_) => "string buffer",
            TensorData::Json(_) => "JSON value",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data_type: DataType,
    pub data: TensorData,
}

impl Tensor {
    /// Build a tensor, checking that `data` agrees with `data_type` and `shape`.
    pub fn new(
        name: impl Into<String>,
        data_type: DataType,
        shape: Vec<usize>,
        data: TensorData,
    ) -> Result<Self> {
        let tensor = Tensor {
            name: name.into(),
            shape,
            data_type,
            data,
        };
        tensor.validate()?;
        Ok(tensor)
    }

    /// A scalar string tensor.
    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Tensor {
            name: name.into(),
            shape: Vec::new(),
            data_type: DataType::String,
            data: TensorData::Str(vec![value.into()]),
        }
    }

    pub fn strings(name: impl Into<String>, values: Vec<String>) -> Self {
        Tensor {
            name: name.into(),
            shape: vec![values.len()],
            data_type: DataType::String,
            data: TensorData::Str(values),
        }
    }

    pub fn ints(name: impl Into<String>, values: Vec<i64>) -> Self {
        Tensor {
            name: name.into(),
            shape: vec![values.len()],
            data_type: DataType::Int64,
            data: TensorData::Int(values),
        }
    }

    pub fn floats(name: impl Into<String>, values: Vec<f64>) -> Self {
        Tensor {
            name: name.into(),
            shape: vec![values.len()],
            data_type: DataType::Double,
            data: TensorData::Float(values),
        }
    }

    /// A scalar bool tensor.
    pub fn bool(name: impl Into<String>, value: bool) -> Self {
        Tensor {
            name: name.into(),
            shape: Vec::new(),
            data_type: DataType::Bool,
            data: TensorData::Bool(vec![value]),
        }
    }

    pub fn json(name: impl Into<String>, object: serde_json::Map<String, Value>) -> Self {
        Tensor {
            name: name.into(),
            shape: Vec::new(),
            data_type: DataType::Json,
            data: TensorData::Json(Value::Object(object)),
        }
    }

    pub fn json_array(name: impl Into<String>, items: Vec<Value>) -> Self {
        Tensor {
            name: name.into(),
            shape: vec![items.len()],
            data_type: DataType::JsonArray,
            data: TensorData::Json(Value::Array(items)),
        }
    }

    /// Number of elements described by the shape. An empty shape is a scalar.
    ///
    /// `None` when the count does not fit in a `usize`.
    pub fn numel(&self) -> Option<usize> {
        self.shape.iter().try_fold(1usize, |acc, d| acc.checked_mul(*d))
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }

    /// Decode a `{data, shape, type}` map received from the engine.
    pub fn from_wire(name: &str, map: &Value) -> Result<Self> {
        let map = map
            .as_object()
            .ok_or_else(|| BridgeError::malformed(name, "is not a tensor map"))?;

        let data_type = match map.get("type") {
            Some(v) => {
                let code = v.as_i64().ok_or_else(|| {
                    BridgeError::malformed(format!("{name}.type"), "is not an integer")
                })?;
                DataType::from_code(code).ok_or_else(|| {
                    BridgeError::malformed(
                        format!("{name}.type"),
                        format!("has unknown discriminator {code}"),
                    )
                })?
            }
            None => return Err(BridgeError::malformed(format!("{name}.type"), "is missing")),
        };

        let shape = match map.get("shape") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(dims)) => dims
                .iter()
                .map(|d| {
                    d.as_u64().map(|d| d as usize).ok_or_else(|| {
                        BridgeError::malformed(
                            format!("{name}.shape"),
                            format!("contains {d}, not a non-negative integer"),
                        )
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            Some(_) => {
                return Err(BridgeError::malformed(
                    format!("{name}.shape"),
                    "is not an integer sequence",
                ))
            }
        };

        let raw = map
            .get("data")
            .ok_or_else(|| BridgeError::malformed(format!("{name}.data"), "is missing"))?;

        let data = decode_data(name, data_type, &shape, raw)?;
        Tensor::new(name, data_type, shape, data)
    }

    /// Encode into the `{data, shape, type}` map the engine expects.
    pub fn to_wire(&self) -> Value {
        let data = match &self.data {
            TensorData::Int(v) => buffer_to_wire(&self.shape, v),
            TensorData::Float(v) => buffer_to_wire(&self.shape, v),
            TensorData::Bool(v) => buffer_to_wire(&self.shape, v),
            TensorData::Str(v) => buffer_to_wire(&self.shape, v),
            TensorData::Json(v) => v.clone(),
        };
        json!({
            "data": data,
            "shape": self.shape,
            "type": self.data_type.code(),
        })
    }

    fn validate(&self) -> Result<()> {
        let field = || format!("{}.data", self.name);
        let numel = self.numel().ok_or_else(|| {
            BridgeError::malformed(format!("{}.shape", self.name), "element count overflows")
        })?;
        let check_count = |len: usize| {
            if len == numel {
                Ok(())
            } else {
                Err(BridgeError::malformed(
                    field(),
                    format!("holds {len} elements but shape {:?} needs {numel}", self.shape),
                ))
            }
        };

        match (self.data_type.layout(), &self.data) {
            (Layout::Int, TensorData::Int(values)) => {
                check_count(values.len())?;
                if let Some((lo, hi)) = self.data_type.int_range() {
                    if let Some(v) = values.iter().find(|v| **v < lo || **v > hi) {
                        return Err(BridgeError::malformed(
                            field(),
                            format!("value {v} is out of range for {}", self.data_type),
                        ));
                    }
                }
                Ok(())
            }
            (Layout::Float, TensorData::Float(values)) => {
                check_count(values.len())?;
                // JSON has no encoding for NaN or infinities
                match values.iter().position(|v| !v.is_finite()) {
                    Some(i) => Err(BridgeError::malformed(
                        field(),
                        format!("element {i} is not a finite number"),
                    )),
                    None => Ok(()),
                }
            }
            (Layout::Bool, TensorData::Bool(values)) => check_count(values.len()),
            (Layout::Str, TensorData::Str(values)) => check_count(values.len()),
            (Layout::JsonObject, TensorData::Json(value)) => {
                if value.is_object() {
                    Ok(())
                } else {
                    Err(BridgeError::malformed(field(), "must be a JSON object"))
                }
            }
            (Layout::JsonArray, TensorData::Json(value)) => {
                let items = value
                    .as_array()
                    .ok_or_else(|| BridgeError::malformed(field(), "must be a JSON array"))?;
                if self.shape.is_empty() || self.shape == [items.len()] {
                    Ok(())
                } else {
                    Err(BridgeError::malformed(
                        format!("{}.shape", self.name),
                        format!("{:?} does not describe {} items", self.shape, items.len()),
                    ))
                }
            }
            (_, data) => Err(BridgeError::malformed(
                field(),
                format!("{} does not match type {}", data.kind(), self.data_type),
            )),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.data {
            TensorData::Str(v) if v.len() == 1 => Some(v[0].as_str()),
            _ => None,
        }
    }

    pub fn as_strings(&self) -> Option<&[String]> {
        match &self.data {
            TensorData::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match &self.data {
            TensorData::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_floats(&self) -> Option<&[f64]> {
        match &self.data {
            TensorData::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bools(&self) -> Option<&[bool]> {
        match &self.data {
            TensorData::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn first_bool(&self) -> Option<bool> {
        self.as_bools().and_then(|v| v.first().copied())
    }

    pub fn as_json(&self) -> Option<&Value> {
        match &self.data {
            TensorData::Json(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor `{}`: type={}, shape={:?}",
            self.name, self.data_type, self.shape
        )
    }
}

fn buffer_to_wire<T: serde::Serialize>(shape: &[usize], values: &[T]) -> Value {
    if shape.is_empty() && values.len() == 1 {
        json!(values[0])
    } else {
        json!(values)
    }
}

fn decode_data(name: &str, data_type: DataType, shape: &[usize], raw: &Value) -> Result<TensorData> {
    let field = format!("{name}.data");

    let layout = data_type.layout();
    if matches!(layout, Layout::JsonObject | Layout::JsonArray) {
        return Ok(TensorData::Json(raw.clone()));
    }

    let elements: Vec<&Value> = match raw {
        Value::Array(items) => items.iter().collect(),
        scalar if shape.is_empty() => vec![scalar],
        _ => {
            return Err(BridgeError::malformed(
                field,
                format!("is a scalar but shape is {shape:?}"),
            ))
        }
    };

    fn collect<T>(
        field: &str,
        elements: &[&Value],
        expected: &str,
        convert: impl Fn(&Value) -> Option<T>,
    ) -> Result<Vec<T>> {
        elements
            .iter()
            .enumerate()
            .map(|(i, v)| {
                convert(v).ok_or_else(|| {
                    BridgeError::malformed(field, format!("element {i} is not {expected}"))
                })
            })
            .collect()
    }

    Ok(match layout {
        Layout::Int => TensorData::Int(collect(&field, &elements, "an integer", Value::as_i64)?),
        Layout::Float => TensorData::Float(collect(&field, &elements, "a number", Value::as_f64)?),
        Layout::Bool => TensorData::Bool(collect(&field, &elements, "a bool", Value::as_bool)?),
        Layout::Str => TensorData::Str(collect(&field, &elements, "a string", |v| {
            v.as_str().map(str::to_string)
        })?),
        Layout::JsonObject | Layout::JsonArray => unreachable!("JSON layouts handled above"),
    })
}
