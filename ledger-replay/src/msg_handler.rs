//! Serves replay requests from peers, and checks their responses.

use std::{collections::btree_map::Entry, sync::Arc};

use crate::{
    config::Config,
    error::ResponseError,
    ledger::{
        decode_skip_list, encode_skip_list, skip_list_hash, transaction_root, Hash,
        OrderedTransactions,
    },
    message::{ReplayDeltaResponse, ReplyError, SkipListResponse},
    replayer::LedgerReplayer,
    service_traits::LedgerStore,
};

/// Handles the ledger replay protocol messages for one node.
///
/// Requests are answered from local ledgers. Responses are verified against
/// the requested ledger hash before they reach the [`LedgerReplayer`], so a
/// peer can't make a replay acquisition use data for another ledger.
#[derive(Clone)]
pub struct ReplayMsgHandler {
    enable: bool,
    store: Arc<dyn LedgerStore>,
    replayer: Arc<LedgerReplayer>,
}

impl std::fmt::Debug for ReplayMsgHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayMsgHandler")
            .field("enable", &self.enable)
            .finish_non_exhaustive()
    }
}

impl ReplayMsgHandler {
    /// Creates a handler that serves from `store`, and routes responses to `replayer`.
    pub fn new(config: &Config, store: Arc<dyn LedgerStore>, replayer: Arc<LedgerReplayer>) -> Self {
        Self {
            enable: config.enable,
            store,
            replayer,
        }
    }

    /// Answers a skip list request.
    pub fn process_skip_list_request(&self, ledger_hash: Hash) -> SkipListResponse {
        if !self.enable {
            return SkipListResponse::error(ledger_hash, ReplyError::Disabled);
        }

        let Some(ledger) = self.store.ledger_by_hash(ledger_hash) else {
            tracing::trace!(?ledger_hash, "peer asked for a skip list we don't have");
            return SkipListResponse::error(ledger_hash, ReplyError::NoLedger);
        };

        if ledger.skip_list().is_empty() {
            return SkipListResponse::error(ledger_hash, ReplyError::NoNode);
        }

        SkipListResponse {
            ledger_hash,
            header: Some(ledger.header().clone()),
            item: encode_skip_list(ledger.skip_list()),
            error: None,
        }
    }

    /// Answers a replay delta request.
    pub fn process_replay_delta_request(&self, ledger_hash: Hash) -> ReplayDeltaResponse {
        if !self.enable {
            return ReplayDeltaResponse::error(ledger_hash, ReplyError::Disabled);
        }

        let Some(ledger) = self.store.ledger_by_hash(ledger_hash) else {
            tracing::trace!(?ledger_hash, "peer asked for a replay delta we don't have");
            return ReplayDeltaResponse::error(ledger_hash, ReplyError::NoLedger);
        };

        ReplayDeltaResponse {
            ledger_hash,
            header: Some(ledger.header().clone()),
            transactions: ledger
                .transactions()
                .iter()
                .map(|(index, tx)| (*index, tx.as_ref().clone()))
                .collect(),
            error: None,
        }
    }

    /// Verifies a skip list response, and passes it to the replayer.
    pub fn process_skip_list_response(&self, response: SkipListResponse) -> Result<(), ResponseError> {
        if let Some(error) = response.error {
            return Err(ResponseError::Peer(error));
        }

        let header = response.header.ok_or(ResponseError::MissingHeader)?;

        let actual = header.hash();
        if actual != response.ledger_hash {
            return Err(ResponseError::WrongLedger {
                requested: response.ledger_hash,
                actual,
            });
        }

        // The header commits to the skip list, whose last hash is the parent.
        let skip_list = decode_skip_list(&response.item)?;
        if skip_list_hash(&skip_list) != header.skip_list_hash
            || skip_list
                .last()
                .map_or(false, |last| *last != header.parent_hash)
        {
            return Err(ResponseError::SkipListMismatch);
        }

        self.replayer.got_skip_list(&header, &response.item);

        Ok(())
    }

    /// Verifies a replay delta response, and passes it to the replayer.
    pub fn process_replay_delta_response(
        &self,
        response: ReplayDeltaResponse,
    ) -> Result<(), ResponseError> {
        if let Some(error) = response.error {
            return Err(ResponseError::Peer(error));
        }

        let header = response.header.ok_or(ResponseError::MissingHeader)?;

        let actual = header.hash();
        if actual != response.ledger_hash {
            return Err(ResponseError::WrongLedger {
                requested: response.ledger_hash,
                actual,
            });
        }

        let mut transactions = OrderedTransactions::new();
        for (index, tx) in response.transactions {
            match transactions.entry(index) {
                Entry::Vacant(entry) => {
                    entry.insert(Arc::new(tx));
                }
                Entry::Occupied(_) => return Err(ResponseError::DuplicateIndex(index)),
            }
        }

        if transaction_root(&transactions) != header.tx_hash {
            return Err(ResponseError::TxRootMismatch);
        }

        self.replayer.got_replay_delta(header, transactions);

        Ok(())
    }
}
