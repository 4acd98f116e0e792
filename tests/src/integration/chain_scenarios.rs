//! Header-chain and filter-chain flows exercised through fully wired
//! services, the way the runtime assembles them.

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::*;
    use ln_01_header_chain::ChainUpdate;
    use shared_bus::ChainEvent;
    use shared_types::{ChainPosition, FilterType, NetworkParams};

    /// Fresh store with genesis at height 0; one connecting header at
    /// height 1 becomes the best position.
    #[test]
    fn test_fresh_store_extends_to_height_one() {
        let params = NetworkParams::regtest();
        let stores = store_pair(&params);
        let chain = build_chain(&params, 1);

        assert_eq!(stores.headers.best().height, 0);

        extend_headers(&stores, &chain);

        let expected = ChainPosition::new(1, chain[1].block_hash());
        assert_eq!(stores.headers.best(), expected);
        assert_eq!(
            stores.internal_events.events(),
            vec![ChainEvent::TipAdvanced { tip: expected }]
        );
    }

    /// Store at tip height 10 on chain A; a reorg batch with fork point 7
    /// and chain-B positions for 8..=10 replaces exactly that suffix and
    /// announces exactly one reorg with the fork and new tip.
    #[test]
    fn test_reorg_replaces_suffix_with_single_notification() {
        let params = NetworkParams::regtest();
        let stores = store_pair(&params);
        let chain_a = build_chain(&params, 10);
        extend_headers(&stores, &chain_a);
        assert_eq!(stores.headers.best().height, 10);

        // Chain B shares heights 0..=7 and diverges above.
        let mut chain_b = Vec::new();
        let mut parent = chain_a[7];
        for n in 0..3u32 {
            let header = shared_types::BlockHeader {
                version: 1,
                parent_hash: parent.block_hash(),
                merkle_root: [0xB0 + n as u8; 32],
                time: parent.time + 60,
                bits: 0x207F_FFFF,
                nonce: 9_000 + n,
            };
            chain_b.push(header);
            parent = header;
        }
        let fork = ChainPosition::new(7, chain_a[7].block_hash());
        let new_best: Vec<ChainPosition> = chain_b
            .iter()
            .enumerate()
            .map(|(i, h)| ChainPosition::new(8 + i as i64, h.block_hash()))
            .collect();

        let mut update = ChainUpdate::reorg(fork, chain_b.clone(), new_best.clone());
        update.siblings_add = chain_a[8..].iter().map(|h| h.block_hash()).collect();
        stores.headers.apply_update(update).unwrap();

        // Replaced range carries exactly the supplied positions.
        assert_eq!(stores.headers.best(), new_best[2]);
        for position in &new_best {
            assert_eq!(
                stores.headers.best_hash_at(position.height).unwrap(),
                Some(position.hash)
            );
        }
        // Everything at and below the fork is untouched.
        for (height, header) in chain_a.iter().take(8).enumerate() {
            assert_eq!(
                stores.headers.best_hash_at(height as i64).unwrap(),
                Some(header.block_hash())
            );
        }

        let reorgs: Vec<ChainEvent> = stores
            .internal_events
            .events()
            .into_iter()
            .filter(|e| matches!(e, ChainEvent::Reorg { .. }))
            .collect();
        assert_eq!(
            reorgs,
            vec![ChainEvent::Reorg {
                fork,
                tip: new_best[2]
            }]
        );
        // Both listener classes got the same payload.
        assert_eq!(
            stores.internal_events.events(),
            stores.external_events.events()
        );
    }

    /// The filter chain tracks a seeded header chain and keeps the tip
    /// ordering invariant through ingestion.
    #[test]
    fn test_filter_chain_follows_header_chain() {
        let params = NetworkParams::regtest();
        let stores = store_pair(&params);
        let chain = build_chain(&params, 6);
        extend_headers(&stores, &chain);

        seed_filters(&stores, &chain, 4);

        let cfheader_tip = stores.filters.cfheader_tip(FilterType::Basic);
        let cfilter_tip = stores.filters.cfilter_tip(FilterType::Basic);
        let header_tip = stores.headers.best();
        assert_eq!(cfheader_tip.height, 4);
        assert_eq!(cfilter_tip.height, 4);
        assert!(cfilter_tip.height <= cfheader_tip.height);
        assert!(cfheader_tip.height <= header_tip.height);

        // Stored filters load back; unstored heights stay absent.
        assert!(stores
            .filters
            .load_cfilter(FilterType::Basic, &chain[3].block_hash())
            .unwrap()
            .is_some());
        assert!(stores
            .filters
            .load_cfilter(FilterType::Basic, &chain[5].block_hash())
            .unwrap()
            .is_none());
    }

    /// A header-chain reorg leaves the filter store able to find the last
    /// position both chains still share.
    #[test]
    fn test_find_best_position_after_header_reorg() {
        let params = NetworkParams::regtest();
        let stores = store_pair(&params);
        let chain = build_chain(&params, 6);
        extend_headers(&stores, &chain);
        seed_filters(&stores, &chain, 6);

        // Reorg the header chain above height 3.
        let fork = ChainPosition::new(3, chain[3].block_hash());
        let mut alt = Vec::new();
        let mut parent = chain[3];
        for n in 0..4u32 {
            let header = shared_types::BlockHeader {
                version: 1,
                parent_hash: parent.block_hash(),
                merkle_root: [0xC0 + n as u8; 32],
                time: parent.time + 60,
                bits: 0x207F_FFFF,
                nonce: 7_000 + n,
            };
            alt.push(header);
            parent = header;
        }
        let alt_best: Vec<ChainPosition> = alt
            .iter()
            .enumerate()
            .map(|(i, h)| ChainPosition::new(4 + i as i64, h.block_hash()))
            .collect();
        stores
            .headers
            .apply_update(ChainUpdate::reorg(fork, alt.clone(), alt_best))
            .unwrap();

        // The stale cfheader tip (height 6, old chain) is no longer
        // consistent: the store falls back to the fork point.
        let stale = stores.filters.cfheader_tip(FilterType::Basic);
        let best = stores.filters.find_best_position(FilterType::Basic, stale);
        assert_eq!(best, fork);
    }
}
