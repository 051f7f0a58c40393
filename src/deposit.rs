mod payout;
mod tx;

pub use payout::{redirect_sighash, warning_sighash, PayoutTx, SignedPayoutTx};
pub use tx::{
    expected_multisig_amount, required_contribution, sighash, verify_input_signatures,
    ChangeOutput, DepositTx, DepositTxParams, InputSelection, InputSignature, MultisigOutput,
    OutPoint, RawTransactionInput, SignedDepositTx, Transaction, TxId,
};
