use anyhow::{anyhow, Result};
use bytecheck::CheckBytes;
use rkyv::ser::serializers::AllocSerializer;
use rkyv::ser::Serializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{archived_root, check_archived_root, Archive, Archived, Deserialize, Serialize};
use std::marker::PhantomData;

fn archive<T>(t: &T) -> Vec<u8>
where
    T: Serialize<AllocSerializer<256>>,
{
    let mut ser = AllocSerializer::<256>::default();
    ser.serialize_value(t).unwrap();
    ser.into_serializer().into_inner().to_vec()
}

/// Owned archive bytes with typed zero-copy access.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Ref<T> {
    marker: PhantomData<T>,
    bytes: Vec<u8>,
}

impl<T: Archive> Ref<T> {
    pub fn archive(t: &T) -> Self
    where
        T: Serialize<AllocSerializer<256>>,
    {
        Self {
            marker: PhantomData,
            bytes: archive(t),
        }
    }

    /// Validates untrusted bytes before granting access.
    pub fn checked(bytes: &[u8]) -> Result<Self>
    where
        Archived<T>: for<'a> CheckBytes<DefaultValidator<'a>>,
    {
        check_archived_root::<T>(bytes).map_err(|err| anyhow!("{}", err))?;
        Ok(Self {
            marker: PhantomData,
            bytes: bytes.to_vec(),
        })
    }

    pub fn to_owned(&self) -> Result<T>
    where
        Archived<T>: Deserialize<T, rkyv::Infallible>,
    {
        Ok(self.as_ref().deserialize(&mut rkyv::Infallible)?)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl<T: Archive> AsRef<Archived<T>> for Ref<T> {
    fn as_ref(&self) -> &Archived<T> {
        unsafe { archived_root::<T>(&self.bytes[..]) }
    }
}

/// Wire name of an error kind, shared by both peers so their session error
/// lists converge.
pub fn error_kind(err: &anyhow::Error) -> &'static str {
    use chum_store::StoreError::*;
    match chum_store::StoreError::kind_of(err) {
        Some(Decode(_)) => "decode-error",
        Some(HashMismatch { .. }) => "hash-mismatch",
        Some(NotFound(_)) => "not-found",
        Some(PermissionDenied(_)) => "permission-denied",
        Some(ConflictMerge(_)) => "conflict-merge",
        Some(ConnectionClosed) => "connection-closed",
        Some(InvalidState(_)) => "invalid-state",
        Some(AlreadyInitialized) => "invalid-state",
        Some(InvalidSecret) => "invalid-secret",
        None => "error",
    }
}
