use serde::{de::DeserializeOwned, Serialize};

use crate::{Error, ErrorKind, Result, SerializeType};

impl SerializeType {
    pub fn encode<T>(&self, value: &T) -> Result<Vec<u8>>
    where
        T: Serialize + ?Sized,
    {
        match self {
            SerializeType::JSON => serde_json::to_vec(value).map_err(Error::from),
            SerializeType::MsgPack => rmp_serde::to_vec_named(value).map_err(Error::from),
            _ => Err(Error::new(
                ErrorKind::Serialize,
                format!("unsupported serializer {}", self),
            )),
        }
    }

    pub fn decode<T>(&self, data: &[u8]) -> Result<T>
    where
        T: DeserializeOwned,
    {
        match self {
            SerializeType::JSON => serde_json::from_slice(data).map_err(Error::from),
            SerializeType::MsgPack => rmp_serde::from_slice(data).map_err(Error::from),
            _ => Err(Error::new(
                ErrorKind::Serialize,
                format!("unsupported serializer {}", self),
            )),
        }
    }
}

/// Resolves a serializer code read off the wire.
pub fn serializer_of(code: u8) -> Result<SerializeType> {
    use num_traits::FromPrimitive;
    SerializeType::from_u8(code)
        .ok_or_else(|| Error::new(ErrorKind::Serialize, format!("unknown serializer code {}", code)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct ArithAddArgs {
        #[serde(rename = "A")]
        a: u64,
        #[serde(rename = "B")]
        b: u64,
    }

    #[test]
    fn json() {
        let args = ArithAddArgs { a: 1, b: 2 };
        let bs = SerializeType::JSON.encode(&args).unwrap();
        assert_eq!(br#"{"A":1,"B":2}"#.to_vec(), bs);
        let back: ArithAddArgs = SerializeType::JSON.decode(&bs).unwrap();
        assert_eq!(args, back);
    }

    #[test]
    fn msgpack() {
        let args = ArithAddArgs { a: 10, b: 20 };
        let bs = SerializeType::MsgPack.encode(&args).unwrap();
        let back: ArithAddArgs = SerializeType::MsgPack.decode(&bs).unwrap();
        assert_eq!(args, back);
    }

    #[test]
    fn unsupported() {
        let err = SerializeType::ProtoBuffer
            .encode(&ArithAddArgs::default())
            .unwrap_err();
        assert_eq!(ErrorKind::Serialize, err.kind());
        assert!(serializer_of(42).is_err());
        assert_eq!(SerializeType::MsgPack, serializer_of(3).unwrap());
    }
}
