use std::collections::HashSet;

use serde::Deserialize;

/// Subset of the explorer's raw block payload needed to collect output addresses
#[derive(Debug, Deserialize)]
pub struct RawBlock {
    pub tx: Vec<RawTransaction>,
}

#[derive(Debug, Deserialize)]
pub struct RawTransaction {
    #[serde(default)]
    pub out: Vec<RawOutput>,
}

#[derive(Debug, Deserialize)]
pub struct RawOutput {
    /// Absent for outputs without a standard destination (OP_RETURN, bare multisig, ...)
    pub addr: Option<String>,
}

impl RawBlock {
    /// Every destination address in the block, deduplicated
    pub fn addresses(self) -> HashSet<String> {
        self.tx
            .into_iter()
            .flat_map(|tx| tx.out.into_iter().filter_map(|out| out.addr))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_addresses_are_deduplicated() {
        let block: RawBlock = serde_json::from_value(json!({
            "hash": "00000000839a8e6886ab5951d76f411475428afc90947ee320161bbf18eb6048",
            "tx": [
                {
                    "out": [
                        { "addr": "12c6DSiU4Rq3P4ZxziKxzrGNiG1jp8jQ2w", "value": 5000000000u64 },
                        { "addr": "1HLoD9E4SDFFPDiYfNYnkBLQ85Y51J3Zb1", "value": 10 }
                    ]
                },
                {
                    "out": [
                        { "addr": "12c6DSiU4Rq3P4ZxziKxzrGNiG1jp8jQ2w", "value": 1 },
                        { "value": 0, "script": "6a" }
                    ]
                }
            ]
        }))
        .unwrap();

        let mut addresses: Vec<_> = block.addresses().into_iter().collect();
        addresses.sort();

        assert_eq!(
            addresses,
            vec![
                "12c6DSiU4Rq3P4ZxziKxzrGNiG1jp8jQ2w",
                "1HLoD9E4SDFFPDiYfNYnkBLQ85Y51J3Zb1"
            ]
        );
    }

    #[test]
    fn test_transaction_without_outputs() {
        let block: RawBlock = serde_json::from_value(json!({ "tx": [{}] })).unwrap();

        assert!(block.addresses().is_empty());
    }

    #[test]
    fn test_missing_tx_list_is_rejected() {
        let res = serde_json::from_value::<RawBlock>(json!({ "height": 1 }));

        assert!(res.is_err());
    }
}
