//! Bitcoin side of the swap: the HTLC witness script and its P2WSH address.
//!
//! ```text
//! OP_IF
//!     OP_SHA256 <secret_hash> OP_EQUALVERIFY <recipient_pubkey> OP_CHECKSIG
//! OP_ELSE
//!     <timelock> OP_CHECKLOCKTIMEVERIFY OP_DROP <sender_pubkey> OP_CHECKSIG
//! OP_ENDIF
//! ```
//!
//! Both parties derive the address on their own from the same parameters and
//! compare, so derivation is a pure function of [`HtlcParams`].

use crate::{ledger, Error, SecretHash, Timestamp};
use bitcoin::{
    blockdata::{opcodes::all::*, script::Builder},
    Address, PublicKey, Script,
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HtlcParams {
    pub secret_hash: SecretHash,
    #[serde(with = "serde_public_key")]
    pub recipient_pubkey: PublicKey,
    #[serde(with = "serde_public_key")]
    pub sender_pubkey: PublicKey,
    pub timelock: Timestamp,
    pub network: ledger::Bitcoin,
}

/// A derived HTLC: where to send the coins and what script unlocks them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BitcoinHtlc {
    pub address: Address,
    pub witness_script: Script,
    pub script_pubkey: Script,
}

impl BitcoinHtlc {
    pub fn witness_script_hex(&self) -> String {
        hex::encode(self.witness_script.as_bytes())
    }

    pub fn script_pubkey_hex(&self) -> String {
        hex::encode(self.script_pubkey.as_bytes())
    }
}

impl HtlcParams {
    pub fn validate(&self) -> Result<(), Error> {
        if !self.recipient_pubkey.compressed {
            return Err(Error::validation("recipient public key must be compressed"));
        }
        if !self.sender_pubkey.compressed {
            return Err(Error::validation("sender public key must be compressed"));
        }
        if self.recipient_pubkey == self.sender_pubkey {
            return Err(Error::validation(
                "recipient and sender public keys must differ",
            ));
        }
        if !self.timelock.is_unix_time() {
            return Err(Error::validation(format!(
                "timelock {} is a block height, expected a unix timestamp",
                self.timelock
            )));
        }

        Ok(())
    }

    pub fn witness_script(&self) -> Script {
        Builder::new()
            .push_opcode(OP_IF)
            .push_opcode(OP_SHA256)
            .push_slice(self.secret_hash.as_raw())
            .push_opcode(OP_EQUALVERIFY)
            .push_key(&self.recipient_pubkey)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ELSE)
            .push_int(i64::from(u32::from(self.timelock)))
            .push_opcode(OP_CLTV)
            .push_opcode(OP_DROP)
            .push_key(&self.sender_pubkey)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ENDIF)
            .into_script()
    }
}

/// Derives the witness script, P2WSH script pubkey and bech32 address.
pub fn generate_htlc_address(params: &HtlcParams) -> Result<BitcoinHtlc, Error> {
    params.validate()?;

    let witness_script = params.witness_script();
    let address = Address::p2wsh(&witness_script, params.network.into());
    let script_pubkey = address.script_pubkey();

    Ok(BitcoinHtlc {
        address,
        witness_script,
        script_pubkey,
    })
}

/// Independently re-derives the HTLC and compares it with one that was
/// handed to us.
pub fn verify_htlc(params: &HtlcParams, htlc: &BitcoinHtlc) -> Result<(), Error> {
    let expected = generate_htlc_address(params)?;

    if expected.witness_script != htlc.witness_script {
        return Err(Error::ScriptMismatch {
            expected: expected.witness_script_hex(),
            actual: htlc.witness_script_hex(),
        });
    }

    if expected.address != htlc.address || expected.script_pubkey != htlc.script_pubkey {
        return Err(Error::ScriptMismatch {
            expected: expected.address.to_string(),
            actual: htlc.address.to_string(),
        });
    }

    Ok(())
}

pub mod serde_public_key {
    use bitcoin::PublicKey;
    use serde::{de, Deserializer, Serializer};
    use std::{fmt, str::FromStr};

    pub fn serialize<S>(key: &PublicKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&key.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PublicKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;

        impl<'de> de::Visitor<'de> for Visitor {
            type Value = PublicKey;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a hex encoded public key")
            }

            fn visit_str<E>(self, v: &str) -> Result<PublicKey, E>
            where
                E: de::Error,
            {
                PublicKey::from_str(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(Visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_harness::keypair, Secret};
    use quickcheck_macros::quickcheck;
    use spectral::prelude::*;

    fn params(seed: u8, timelock: u32) -> HtlcParams {
        let secret = Secret::from([seed; 32]);

        HtlcParams {
            secret_hash: secret.hash(),
            recipient_pubkey: keypair(seed.wrapping_add(1)).1,
            sender_pubkey: keypair(seed.wrapping_add(2)).1,
            timelock: Timestamp::from(timelock),
            network: ledger::Bitcoin::Testnet,
        }
    }

    #[test]
    fn witness_script_has_expected_layout() {
        let params = params(7, 1_600_000_000);
        let script = params.witness_script().into_bytes();

        let mut expected = vec![0x63, 0xa8, 0x20];
        expected.extend_from_slice(params.secret_hash.as_raw());
        expected.extend_from_slice(&[0x88, 0x21]);
        expected.extend_from_slice(&params.recipient_pubkey.to_bytes());
        expected.extend_from_slice(&[0xac, 0x67]);
        // 1_600_000_000 as a minimally encoded script number
        expected.extend_from_slice(&[0x04, 0x00, 0x10, 0x5e, 0x5f]);
        expected.extend_from_slice(&[0xb1, 0x75, 0x21]);
        expected.extend_from_slice(&params.sender_pubkey.to_bytes());
        expected.extend_from_slice(&[0xac, 0x68]);

        assert_that(&script).is_equal_to(expected);
    }

    #[test]
    fn testnet_address_is_bech32_p2wsh() {
        let htlc = generate_htlc_address(&params(1, 1_600_000_000)).unwrap();

        assert_that(&htlc.address.to_string()).starts_with("tb1q");
        assert_that(&htlc.address.to_string().len()).is_equal_to(62);
        assert_eq!(&htlc.script_pubkey.as_bytes()[..2], &[0x00, 0x20]);
    }

    #[test]
    fn regtest_address_uses_bcrt_prefix() {
        let mut params = params(1, 1_600_000_000);
        params.network = ledger::Bitcoin::Regtest;

        let htlc = generate_htlc_address(&params).unwrap();

        assert_that(&htlc.address.to_string()).starts_with("bcrt1q");
    }

    #[test]
    fn uncompressed_keys_are_rejected() {
        let mut params = params(1, 1_600_000_000);
        params.sender_pubkey.compressed = false;

        let result = generate_htlc_address(&params);

        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn block_height_timelock_is_rejected() {
        let result = generate_htlc_address(&params(1, 680_000));

        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn tampered_script_is_detected() {
        let params = params(3, 1_600_000_000);
        let mut htlc = generate_htlc_address(&params).unwrap();

        let other = HtlcParams {
            timelock: params.timelock.plus(1),
            ..params
        };
        htlc.witness_script = other.witness_script();

        let result = verify_htlc(&params, &htlc);

        assert!(matches!(result, Err(Error::ScriptMismatch { .. })));
    }

    #[test]
    fn tampered_address_is_detected() {
        let params = params(3, 1_600_000_000);
        let mut htlc = generate_htlc_address(&params).unwrap();
        htlc.address = generate_htlc_address(&HtlcParams {
            network: ledger::Bitcoin::Mainnet,
            ..params
        })
        .unwrap()
        .address;

        let result = verify_htlc(&params, &htlc);

        assert!(matches!(result, Err(Error::ScriptMismatch { .. })));
    }

    #[test]
    fn params_survive_json() {
        let params = params(9, 1_600_000_000);

        let json = serde_json::to_string(&params).unwrap();
        let rinsed = serde_json::from_str::<HtlcParams>(&json).unwrap();

        assert_that(&rinsed).is_equal_to(params);
    }

    #[quickcheck]
    fn derivation_is_deterministic(seed: u8, timelock: u32) -> bool {
        let timelock = timelock.max(crate::timestamp::LOCKTIME_THRESHOLD);
        let params = params(seed, timelock);

        let first = generate_htlc_address(&params).unwrap();
        let second = generate_htlc_address(&params).unwrap();

        first == second
            && first.witness_script_hex() == second.witness_script_hex()
            && verify_htlc(&params, &first).is_ok()
    }
}
