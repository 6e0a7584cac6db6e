//! Held signing keys and their runtime state.

use std::collections::HashMap;

use crate::ledger::rpc::WalletState;
use crate::ledger::{Amount, PublicKey, SignerKey, Token, WalletTag};
use crate::settlement::fee::FeeSchedule;

/// One held key with the chain state the engine tracks for it.
#[derive(Debug)]
pub struct SignerState {
    pub key: SignerKey,
    /// Last nonce used. The next fresh request gets `nonce + 1`.
    pub nonce: u64,
    pub balances: HashMap<Token, Amount>,
    pub emitter: bool,
    pub approver: bool,
    /// Requests signed so far, used for load leveling.
    pub signed: u64,
}

impl SignerState {
    /// Build from on-chain state, reconciling the nonce with the store.
    pub fn reconcile(key: SignerKey, chain: &WalletState, store_nonce: Option<u64>) -> Self {
        Self {
            key,
            nonce: chain.last_nonce.max(store_nonce.unwrap_or(0)),
            balances: chain.balances.clone(),
            emitter: chain.has_tag(WalletTag::Emitter),
            approver: chain.has_tag(WalletTag::Approver),
            signed: 0,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.key.public_key()
    }

    pub fn balance(&self, token: Token) -> Amount {
        self.balances.get(&token).copied().unwrap_or(Amount::ZERO)
    }

    /// Claim the next nonce.
    pub fn advance_nonce(&mut self) -> u64 {
        self.nonce += 1;
        self.signed += 1;
        self.nonce
    }

    /// Give back `nonce` if nothing was assigned after it.
    pub fn rollback_nonce(&mut self, nonce: u64) -> bool {
        if self.nonce == nonce {
            self.nonce -= 1;
            true
        } else {
            false
        }
    }
}

/// Signer chosen for a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub signer: PublicKey,
    pub fee: Amount,
    pub emitter: bool,
}

/// All held signers.
#[derive(Debug, Default)]
pub struct SignerTable {
    signers: Vec<SignerState>,
}

impl SignerTable {
    pub fn new(signers: Vec<SignerState>) -> Self {
        Self { signers }
    }

    pub fn len(&self) -> usize {
        self.signers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signers.is_empty()
    }

    pub fn get(&self, key: &PublicKey) -> Option<&SignerState> {
        self.signers.iter().find(|s| s.public_key() == *key)
    }

    pub fn get_mut(&mut self, key: &PublicKey) -> Option<&mut SignerState> {
        self.signers.iter_mut().find(|s| s.public_key() == *key)
    }

    /// Signers ordered by requests signed, ties in configuration order.
    fn by_load(&self) -> Vec<&SignerState> {
        let mut ordered: Vec<_> = self.signers.iter().collect();
        ordered.sort_by_key(|s| s.signed);
        ordered
    }

    /// Pick a signer for sending `amount` of `token`.
    ///
    /// An emitter wins unconditionally. Otherwise the least loaded signer
    /// whose balance covers amount plus fee.
    pub fn select_for_transfer(&self, token: Token, amount: Amount, fees: &FeeSchedule) -> Option<Selection> {
        let ordered = self.by_load();
        if let Some(emitter) = ordered.iter().find(|s| s.emitter) {
            return Some(Selection {
                signer: emitter.public_key(),
                fee: fees.fee(token, amount, emitter.balance(token.other())),
                emitter: true,
            });
        }
        ordered.into_iter().find_map(|s| {
            let fee = fees.fee(token, amount, s.balance(token.other()));
            let needed = amount.checked_add(fee)?;
            (s.balance(token) >= needed).then(|| Selection {
                signer: s.public_key(),
                fee,
                emitter: false,
            })
        })
    }

    /// Least loaded signer allowed to approve wallets.
    pub fn select_approver(&self) -> Option<PublicKey> {
        self.by_load()
            .into_iter()
            .find(|s| s.approver)
            .map(SignerState::public_key)
    }

    /// Debit a signer's cached balance when a fresh request is marked Posted.
    ///
    /// The debit is optimistic: it happens before the broadcast outcome is
    /// known and is reverted only by [`SignerTable::credit_back`] on a
    /// recognized terminal rejection. Emitters are never debited.
    pub fn apply_optimistic_debit(&mut self, signer: &PublicKey, token: Token, total: Amount) -> bool {
        let Some(state) = self.get_mut(signer) else {
            return false;
        };
        if state.emitter {
            return false;
        }
        let balance = state.balance(token).saturating_sub(total);
        state.balances.insert(token, balance);
        tracing::debug!(signer = %signer, token = %token, debited = %total, balance = %balance, "Balance debited");
        true
    }

    /// Revert an optimistic debit.
    pub fn credit_back(&mut self, signer: &PublicKey, token: Token, total: Amount) {
        if let Some(state) = self.get_mut(signer) {
            let balance = state.balance(token).saturating_add(total);
            state.balances.insert(token, balance);
            tracing::debug!(signer = %signer, token = %token, credited = %total, balance = %balance, "Balance credited back");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeeConfig;

    fn signer(seed: u8, coin: u64, stable: u64, tags: Vec<WalletTag>) -> SignerState {
        let chain = WalletState {
            balances: [(Token::Coin, Amount::whole(coin)), (Token::Stable, Amount::whole(stable))]
                .into_iter()
                .collect(),
            tags,
            last_nonce: 7,
        };
        SignerState::reconcile(SignerKey::from_seed([seed; 32]), &chain, None)
    }

    fn fees() -> FeeSchedule {
        FeeSchedule::new(&FeeConfig::default())
    }

    #[test]
    fn test_reconcile_takes_larger_nonce() {
        let chain = WalletState {
            last_nonce: 4,
            ..Default::default()
        };
        let key = SignerKey::from_seed([1; 32]);
        assert_eq!(SignerState::reconcile(key.clone(), &chain, Some(9)).nonce, 9);
        assert_eq!(SignerState::reconcile(key.clone(), &chain, Some(2)).nonce, 4);
        assert_eq!(SignerState::reconcile(key, &chain, None).nonce, 4);
    }

    #[test]
    fn test_selects_least_loaded_with_funds() {
        let mut poor = signer(1, 0, 5, vec![]);
        poor.signed = 0;
        let mut rich = signer(2, 0, 500, vec![]);
        rich.signed = 3;
        let mut richer = signer(3, 0, 500, vec![]);
        richer.signed = 1;
        let table = SignerTable::new(vec![poor, rich, richer]);

        let pick = table.select_for_transfer(Token::Stable, Amount::whole(10), &fees()).unwrap();
        assert_eq!(pick.signer, SignerKey::from_seed([3; 32]).public_key());
        assert!(!pick.emitter);
    }

    #[test]
    fn test_fee_counts_toward_balance() {
        // 10 stable + 0.01 fee does not fit in 10.
        let table = SignerTable::new(vec![signer(1, 0, 10, vec![])]);
        assert!(table.select_for_transfer(Token::Stable, Amount::whole(10), &fees()).is_none());
    }

    #[test]
    fn test_emitter_wins_unconditionally() {
        let table = SignerTable::new(vec![
            signer(1, 0, 1_000, vec![]),
            signer(2, 0, 0, vec![WalletTag::Emitter]),
        ]);
        let pick = table.select_for_transfer(Token::Stable, Amount::whole(10), &fees()).unwrap();
        assert!(pick.emitter);
        assert_eq!(pick.signer, SignerKey::from_seed([2; 32]).public_key());
    }

    #[test]
    fn test_debit_and_credit() {
        let mut table = SignerTable::new(vec![signer(1, 0, 100, vec![]), signer(2, 0, 0, vec![WalletTag::Emitter])]);
        let a = SignerKey::from_seed([1; 32]).public_key();
        let e = SignerKey::from_seed([2; 32]).public_key();

        assert!(table.apply_optimistic_debit(&a, Token::Stable, Amount::whole(30)));
        assert_eq!(table.get(&a).unwrap().balance(Token::Stable), Amount::whole(70));
        assert!(!table.apply_optimistic_debit(&e, Token::Stable, Amount::whole(30)));

        table.credit_back(&a, Token::Stable, Amount::whole(30));
        assert_eq!(table.get(&a).unwrap().balance(Token::Stable), Amount::whole(100));
    }

    #[test]
    fn test_nonce_advance_and_rollback() {
        let mut s = signer(1, 0, 0, vec![WalletTag::Approver]);
        assert_eq!(s.advance_nonce(), 8);
        assert_eq!(s.advance_nonce(), 9);
        assert!(!s.rollback_nonce(8));
        assert!(s.rollback_nonce(9));
        assert_eq!(s.nonce, 8);
        assert_eq!(s.signed, 2);

        let table = SignerTable::new(vec![signer(2, 0, 0, vec![]), s]);
        assert_eq!(table.select_approver(), Some(SignerKey::from_seed([1; 32]).public_key()));
    }
}
