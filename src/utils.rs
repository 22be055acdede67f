//! Utility functions for identifiers and hashing

use bech32::Bech32m;
use uuid7::uuid7;

pub const APPLICATION_HRP: &str = "app_";
pub const GROUP_HRP: &str = "group_";
pub const MEMBER_HRP: &str = "member_";
pub const ASSIGNMENT_HRP: &str = "asgn_";
pub const DECISION_HRP: &str = "dec_";
pub const ISSUE_HRP: &str = "issue_";
pub const REVOCATION_HRP: &str = "rev_";
pub const FINAL_APPROVAL_HRP: &str = "final_";
pub const THREAD_HRP: &str = "thread_";

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Hash a record into a hex digest over its CBOR encoding.
pub fn cbor_digest<T: minicbor::Encode<()>>(value: &T) -> anyhow::Result<(String, Vec<u8>)> {
    let cbor = minicbor::to_vec(value)?;
    let hash = sha256::digest(&cbor);

    Ok((hash, cbor))
}
