use prost_types::value::Kind;
use prost_types::Value;

use crate::Error;

/// Conversion of a column value into a Rust value.
pub trait FromSpanner<'a>: Sized {
    fn from_spanner(kind: &'a Kind) -> Result<Self, Error>;

    fn from_spanner_null() -> Result<Self, Error> {
        Err(crate::Error::Codec("value was null".to_string()))
    }

    fn from_spanner_nullable(value: &'a Value) -> Result<Self, Error> {
        match &value.kind {
            None | Some(Kind::NullValue(_)) => Self::from_spanner_null(),
            Some(kind) => Self::from_spanner(kind),
        }
    }
}

impl<'a, T> FromSpanner<'a> for Option<T>
where
    T: FromSpanner<'a>,
{
    fn from_spanner(kind: &'a Kind) -> Result<Self, Error> {
        <T as FromSpanner>::from_spanner(kind).map(Some)
    }

    fn from_spanner_null() -> Result<Self, Error> {
        Ok(None)
    }
}

macro_rules! wrong_type {
    ($expect:expr, $kind:expr) => {
        Err(Error::Codec(format!(
            "value {:?} is unsupported by FromSpanner impl, expected {}",
            $kind, $expect,
        )))
    };
}

impl<'a> FromSpanner<'a> for String {
    fn from_spanner(kind: &'a Kind) -> Result<Self, Error> {
        match kind {
            Kind::StringValue(v) => Ok(v.clone()),
            _ => wrong_type!("STRING", kind),
        }
    }
}

impl<'a> FromSpanner<'a> for &'a str {
    fn from_spanner(kind: &'a Kind) -> Result<Self, Error> {
        match kind {
            Kind::StringValue(v) => Ok(v),
            _ => wrong_type!("STRING", kind),
        }
    }
}

impl<'a> FromSpanner<'a> for bool {
    fn from_spanner(kind: &'a Kind) -> Result<Self, Error> {
        match kind {
            Kind::BoolValue(v) => Ok(*v),
            _ => wrong_type!("BOOL", kind),
        }
    }
}

impl<'a> FromSpanner<'a> for f64 {
    fn from_spanner(kind: &'a Kind) -> Result<Self, Error> {
        match kind {
            Kind::NumberValue(v) => Ok(*v),
            Kind::StringValue(v) if v == "NaN" => Ok(f64::NAN),
            Kind::StringValue(v) if v == "Infinity" => Ok(f64::INFINITY),
            Kind::StringValue(v) if v == "-Infinity" => Ok(f64::NEG_INFINITY),
            _ => wrong_type!("FLOAT64", kind),
        }
    }
}

impl<'a> FromSpanner<'a> for Vec<u8> {
    fn from_spanner(kind: &'a Kind) -> Result<Self, Error> {
        match kind {
            Kind::StringValue(v) => {
                base64::decode(v).map_err(|err| Error::Codec(format!("invalid BYTES: {}", err)))
            }
            _ => wrong_type!("BYTES", kind),
        }
    }
}

macro_rules! int64_from {
    ($t:ty) => {
        impl<'a> FromSpanner<'a> for $t {
            fn from_spanner(kind: &'a Kind) -> Result<$t, Error> {
                match kind {
                    Kind::StringValue(v) => v
                        .parse::<i64>()
                        .map_err(|_| Error::Codec(format!("{} is not a valid INT64", v)))
                        .and_then(|v| {
                            <$t>::try_from(v).map_err(|err| Error::Codec(format!("{}", err)))
                        }),
                    _ => wrong_type!("INT64", kind),
                }
            }
        }
    };
    ($($t:ty),+) => {
        $(
            int64_from!($t);
        )+
    };
}

int64_from!(i8, u8, i16, u16, i32, u32, i64, u64);
