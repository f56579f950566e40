// Transaction building: coin selection, change, signing

use crate::core::{Transaction, TxInput, TxOutput};
use crate::storage::UtxoSet;
use crate::wallet::KeyPair;

pub struct TransactionBuilder;

impl TransactionBuilder {
    /// Build and sign a payment of `amount` to `to`, funded from the key
    /// pair's UTXOs, with change returned to the sender.
    pub fn build(
        utxo: &UtxoSet,
        keypair: &KeyPair,
        to: &str,
        amount: u64,
        fee: u64,
    ) -> Result<Transaction, String> {
        if amount == 0 {
            return Err("amount must be positive".to_string());
        }
        let needed = amount + fee;
        let (accumulated, chosen) = utxo.find_spendable(&keypair.address, needed);
        if accumulated < needed {
            return Err(format!(
                "insufficient funds: have {}, need {}",
                accumulated, needed
            ));
        }

        let inputs: Vec<TxInput> = chosen
            .iter()
            .map(|entry| TxInput::new(entry.txid.clone(), entry.index))
            .collect();

        let mut outputs = vec![TxOutput::new(amount, to.to_string())];
        let change = accumulated - needed;
        if change > 0 {
            outputs.push(TxOutput::new(change, keypair.address.clone()));
        }

        let mut tx = Transaction::new(inputs, outputs);
        tx.sign(&keypair.secret_key)?;
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn funded_wallet(values: &[u64]) -> (KeyPair, UtxoSet) {
        let kp = KeyPair::generate();
        let mut utxo = UtxoSet::new(None);
        for (i, v) in values.iter().enumerate() {
            let cb = Transaction::coinbase(&kp.address, *v, &format!("fund-{}", i));
            utxo.add(&cb);
        }
        (kp, utxo)
    }

    #[test]
    fn test_build_with_change() {
        let (kp, utxo) = funded_wallet(&[100]);
        let tx = TransactionBuilder::build(&utxo, &kp, "bob", 30, 1).unwrap();

        assert_eq!(tx.outputs[0].value, 30);
        assert_eq!(tx.outputs[0].to, "bob");
        assert_eq!(tx.outputs[1].value, 69);
        assert_eq!(tx.outputs[1].to, kp.address);
        assert!(tx.verify_signatures().is_ok());

        // fee = inputs - outputs
        let fee = tx.fee_with(|txid, index| utxo.get(txid, index).map(|u| u.value));
        assert_eq!(fee, 1);
    }

    #[test]
    fn test_build_combines_utxos() {
        let (kp, utxo) = funded_wallet(&[40, 40, 40]);
        let tx = TransactionBuilder::build(&utxo, &kp, "bob", 70, 2).unwrap();

        assert!(tx.inputs.len() >= 2);
        let spent: u64 = tx
            .inputs
            .iter()
            .map(|i| utxo.get(&i.txid, i.index).unwrap().value)
            .sum();
        assert_eq!(spent - tx.output_sum(), 2);
    }

    #[test]
    fn test_build_exact_amount_no_change() {
        let (kp, utxo) = funded_wallet(&[31]);
        let tx = TransactionBuilder::build(&utxo, &kp, "bob", 30, 1).unwrap();
        assert_eq!(tx.outputs.len(), 1);
    }

    #[test]
    fn test_insufficient_funds() {
        let (kp, utxo) = funded_wallet(&[10]);
        assert!(TransactionBuilder::build(&utxo, &kp, "bob", 30, 1).is_err());
    }

    #[test]
    fn test_zero_amount_rejected() {
        let (kp, utxo) = funded_wallet(&[10]);
        assert!(TransactionBuilder::build(&utxo, &kp, "bob", 0, 1).is_err());
    }
}
