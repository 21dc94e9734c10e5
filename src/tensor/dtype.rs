use serde::{Deserialize, Serialize};

/// Element types understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Float,
    UInt8,
    Int8,
    Int16,
    Int32,
    Int64,
    String,
    Bool,
    Double,
    Json,
    JsonArray,
}

/// How a data type's payload is laid out in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Int,
    Float,
    Bool,
    Str,
    JsonObject,
    JsonArray,
}

/// A wire discriminator entry.
#[derive(Debug, Clone)]
pub struct DataTypeDef {
    pub code: i64,
    pub name: &'static str,
    pub data_type: DataType,
    pub layout: Layout,
}

/// Discriminator codes used in the `type` field of a tensor map.
pub static DATA_TYPES: &[DataTypeDef] = &[
    DataTypeDef {
        code: 1,
        name: "float",
        data_type: DataType::Float,
        layout: Layout::Float,
    },
    DataTypeDef {
        code: 2,
        name: "uint8",
        data_type: DataType::UInt8,
        layout: Layout::Int,
    },
    DataTypeDef {
        code: 3,
        name: "int8",
        data_type: DataType::Int8,
        layout: Layout::Int,
    },
    DataTypeDef {
        code: 5,
        name: "int16",
        data_type: DataType::Int16,
        layout: Layout::Int,
    },
    DataTypeDef {
        code: 6,
        name: "int32",
        data_type: DataType::Int32,
        layout: Layout::Int,
    },
    DataTypeDef {
        code: 7,
        name: "int64",
        data_type: DataType::Int64,
        layout: Layout::Int,
    },
    DataTypeDef {
        code: 8,
        name: "string",
        data_type: DataType::String,
        layout: Layout::Str,
    },
    DataTypeDef {
        code: 9,
        name: "bool",
        data_type: DataType::Bool,
        layout: Layout::Bool,
    },
    DataTypeDef {
        code: 11,
        name: "double",
        data_type: DataType::Double,
        layout: Layout::Float,
    },
    // JSON payloads travel as trees rather than flat buffers
    DataTypeDef {
        code: 670,
        name: "json",
        data_type: DataType::Json,
        layout: Layout::JsonObject,
    },
    DataTypeDef {
        code: 682,
        name: "json_array",
        data_type: DataType::JsonArray,
        layout: Layout::JsonArray,
    },
];

impl DataType {
    pub fn from_code(code: i64) -> Option<DataType> {
        DATA_TYPES
            .iter()
            .find(|d| d.code == code)
            .map(|d| d.data_type)
    }

    fn def(&self) -> &'static DataTypeDef {
        let code = self.code();
        DATA_TYPES
            .iter()
            .find(|d| d.code == code)
            .expect("every data type code has a table row")
    }

    pub fn code(&self) -> i64 {
        match self {
            DataType::Float => 1,
            DataType::UInt8 => 2,
            DataType::Int8 => 3,
            DataType::Int16 => 5,
            DataType::Int32 => 6,
            DataType::Int64 => 7,
            DataType::String => 8,
            DataType::Bool => 9,
            DataType::Double => 11,
            DataType::Json => 670,
            DataType::JsonArray => 682,
        }
    }

    pub fn layout(&self) -> Layout {
        self.def().layout
    }

    /// Inclusive value range for integer types.
    pub fn int_range(&self) -> Option<(i64, i64)> {
        match self {
            DataType::UInt8 => Some((0, u8::MAX as i64)),
            DataType::Int8 => Some((i8::MIN as i64, i8::MAX as i64)),
            DataType::Int16 => Some((i16::MIN as i64, i16::MAX as i64)),
            DataType::Int32 => Some((i32::MIN as i64, i32::MAX as i64)),
            DataType::Int64 => Some((i64::MIN, i64::MAX)),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.def().name)
    }
}
