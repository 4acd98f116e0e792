//! Peer sessions driven over fully wired stores through the production
//! gateway adapters.

#[cfg(test)]
mod tests {
    use crate::integration::fixtures::*;
    use ln_02_filter_chain::compute_filter_header;
    use ln_03_peer_protocol::domain::message::{
        GetFilterRange, GetHeadersMessage, NetworkAddress, VersionMessage,
    };
    use ln_03_peer_protocol::{Direction, ProtocolError, SessionState, WireMessage};
    use shared_bus::ChainEvent;
    use shared_types::{Checkpoint, FilterType, NetworkParams};

    fn remote_version() -> VersionMessage {
        VersionMessage {
            version: 70_001,
            services: 1 << 10,
            timestamp: 1_700_000_000,
            receiver: NetworkAddress::default(),
            sender: NetworkAddress::default(),
            nonce: 0x5EED_F00D_5EED_F00D,
            user_agent: "/remote:1.0/".into(),
            start_height: 0,
            relay: true,
        }
    }

    async fn complete_handshake(fixture: &SessionFixture) {
        fixture.session.begin().await.unwrap();
        fixture
            .session
            .handle_message(WireMessage::Version(remote_version()))
            .await
            .unwrap();
        fixture
            .session
            .handle_message(WireMessage::Verack)
            .await
            .unwrap();
    }

    /// Outbound session completes its handshake, then the checkpoint
    /// header response mismatches the trusted tuple: the session reaches
    /// Shutdown before Run and issues no Run-state requests.
    #[tokio::test]
    async fn test_checkpoint_mismatch_stops_session_before_run() {
        let base = NetworkParams::regtest();
        let chain = build_chain(&base, 4);
        let mut params = base;
        params.checkpoint = Some(Checkpoint {
            height: 3,
            block_hash: chain[3].block_hash(),
            cfheader: [0x55; 32],
        });

        let fixture = session_over(&params, Direction::Outbound);
        extend_headers(&fixture.stores, &chain);
        complete_handshake(&fixture).await;
        assert_eq!(fixture.session.state(), SessionState::Verify);
        let sent_during_verify = fixture.sink.sent().len();

        // The peer delivers a header that is not the checkpoint block.
        let err = fixture
            .session
            .handle_message(WireMessage::Headers(vec![chain[1]]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::CheckpointMismatch { .. }));

        fixture.session.shutdown(&err.to_string()).await;
        assert_eq!(fixture.session.state(), SessionState::Shutdown);
        // Nothing was sent after the verification requests.
        assert_eq!(fixture.sink.sent().len(), sent_during_verify);
        assert!(!fixture
            .events
            .events()
            .iter()
            .any(|e| matches!(e, ChainEvent::PeerActive { .. })));
    }

    /// A peer asks for 1000 filter headers but only 500 are stored: the
    /// response carries exactly the 500 available, correctly hash-chained,
    /// never padded.
    #[tokio::test]
    async fn test_cfheader_response_truncates_to_stored_prefix() {
        let params = NetworkParams::regtest();
        let chain = build_chain(&params, 1000);
        let stores = store_pair(&params);
        extend_headers(&stores, &chain);
        let chained = seed_filters(&stores, &chain, 500);

        let fixture = session_with_stores(&params, Direction::Inbound, stores);
        complete_handshake(&fixture).await;
        fixture.sink.take();

        fixture
            .session
            .handle_message(WireMessage::GetCfHeaders(GetFilterRange {
                filter_type: FilterType::Basic,
                start_height: 1,
                stop_hash: chain[1000].block_hash(),
            }))
            .await
            .unwrap();

        let sent = fixture.sink.take();
        let WireMessage::CfHeaders(response) = &sent[0] else {
            panic!("expected cfheaders, got {}", sent[0].command());
        };
        assert_eq!(response.filter_headers.len(), 500);

        // The served run is the hash chain we stored, link by link.
        let mut previous = response.previous_filter_header;
        for (index, header) in response.filter_headers.iter().enumerate() {
            assert_eq!(*header, chained[index].1);
            let filter_hash =
                shared_types::double_sha256(&filter_data_for(index + 1));
            assert_eq!(*header, compute_filter_header(&filter_hash, &previous));
            previous = *header;
        }
    }

    /// Header relay serves at most the locator suffix and respects the
    /// stop hash.
    #[tokio::test]
    async fn test_header_relay_suffix_and_stop() {
        let params = NetworkParams::regtest();
        let chain = build_chain(&params, 8);
        let stores = store_pair(&params);
        extend_headers(&stores, &chain);
        let fixture = session_with_stores(&params, Direction::Inbound, stores);
        complete_handshake(&fixture).await;
        fixture.sink.take();

        fixture
            .session
            .handle_message(WireMessage::GetHeaders(GetHeadersMessage {
                version: 70_001,
                locator_hashes: vec![chain[3].block_hash()],
                stop_hash: chain[6].block_hash(),
            }))
            .await
            .unwrap();

        let sent = fixture.sink.take();
        let WireMessage::Headers(served) = &sent[0] else {
            panic!("expected headers");
        };
        assert_eq!(served.as_slice(), &chain[4..=6]);
    }

    /// Two nodes converge: a fresh node dials a seeded node and syncs
    /// headers, filter headers, and filters end to end.
    #[tokio::test]
    async fn test_two_nodes_converge() {
        let params = NetworkParams::regtest();
        let chain = build_chain(&params, 10);

        // Node B: fully seeded server.
        let b_stores = store_pair(&params);
        extend_headers(&b_stores, &chain);
        seed_filters(&b_stores, &chain, 10);
        let b = session_with_stores(&params, Direction::Inbound, b_stores);

        // Node A: fresh client.
        let a = session_over(&params, Direction::Outbound);

        a.session.begin().await.unwrap();
        b.session.begin().await.unwrap();
        pump_until_quiescent(&a, &b).await;

        assert_eq!(a.session.state(), SessionState::Run);
        assert_eq!(b.session.state(), SessionState::Run);

        // A adopted B's chain in full.
        assert_eq!(a.stores.headers.best(), b.stores.headers.best());
        assert_eq!(a.stores.headers.best().height, 10);
        assert_eq!(
            a.stores.filters.cfheader_tip(FilterType::Basic).height,
            10
        );
        assert_eq!(a.stores.filters.cfilter_tip(FilterType::Basic).height, 10);

        // Byte-identical filter data arrived.
        let sample = a
            .stores
            .filters
            .load_cfilter(FilterType::Basic, &chain[7].block_hash())
            .unwrap()
            .unwrap();
        assert_eq!(sample.data, filter_data_for(7));

        // The client observed its own tip advancing.
        assert!(a
            .stores
            .internal_events
            .events()
            .iter()
            .any(|e| matches!(e, ChainEvent::TipAdvanced { tip } if tip.height == 10)));
    }
}
