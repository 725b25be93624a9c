use google_api_proto::google::spanner::v1::TypeCode;
use prost_types::value::Kind;

/// Conversion of Rust values into query parameters.
///
/// Values are encoded the way Cloud Spanner expects them on the wire: `INT64` as decimal strings
/// and `BYTES` as base64 strings.
pub trait ToSpanner {
    fn to_kind(&self) -> Kind;

    fn spanner_type() -> TypeCode
    where
        Self: Sized;
}

macro_rules! simple_to {
    ($t:ty, $code:ident, $self:ident, $into:expr) => {
        impl ToSpanner for $t {
            fn to_kind(&self) -> Kind {
                let $self = self;
                $into
            }

            fn spanner_type() -> TypeCode {
                TypeCode::$code
            }
        }
    };
    ($t:ty, i64_from) => {
        simple_to!($t, Int64, v, Kind::StringValue(i64::from(*v).to_string()));
    };
}

impl<T> ToSpanner for Option<T>
where
    T: ToSpanner,
{
    fn to_kind(&self) -> Kind {
        match self.as_ref() {
            Some(v) => v.to_kind(),
            None => Kind::NullValue(prost_types::NullValue::NullValue as i32),
        }
    }

    fn spanner_type() -> TypeCode {
        T::spanner_type()
    }
}

simple_to!(i8, i64_from);
simple_to!(u8, i64_from);
simple_to!(i16, i64_from);
simple_to!(u16, i64_from);
simple_to!(i32, i64_from);
simple_to!(u32, i64_from);
simple_to!(i64, i64_from);
simple_to!(bool, Bool, v, Kind::BoolValue(*v));
simple_to!(f64, Float64, v, Kind::NumberValue(*v));
simple_to!(String, String, v, Kind::StringValue(v.clone()));
simple_to!(&str, String, v, Kind::StringValue(v.to_string()));
simple_to!(Vec<u8>, Bytes, v, Kind::StringValue(base64::encode(v)));
simple_to!(&[u8], Bytes, v, Kind::StringValue(base64::encode(v)));
