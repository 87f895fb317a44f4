//! Smoke screen tests for the service surface around the trade lifecycle:
//! trader administration, the notification outbox, listings and reports.
//!
//! These mostly walk the happy path and check one rejection per area.
use bonded_exchange::{
    ExchangeConfig, ExchangeError, TradeService, TradeStatus,
    bond::BondEventKind,
    dispute::{DisputeStatus, Party, Resolution},
    notifier::{ChannelSink, LedgerEvent, LedgerSink, Notification, TracingSink},
    query::{TradeFilter, TraderFilter},
    trade::{CurrencyCode, Recipient, TradeRequest},
    trader::{Corridor, Trader, TraderStatus},
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};

fn service() -> TradeService {
    TradeService::temporary(ExchangeConfig::default()).unwrap()
}

fn xaf_ngn() -> Corridor {
    Corridor::new("XAF", "NGN", 2_500_000, 2_400_000, 1, 1_000_000).unwrap()
}

fn active_trader(service: &TradeService, user_id: &str, bond: u64) -> Trader {
    let trader = service.apply_trader(user_id, vec![xaf_ngn()]).unwrap();
    service.approve_trader(&trader.id, "admin_1").unwrap();
    service.deposit_bond(&trader.id, bond).unwrap()
}

fn request(user_id: &str, trader_id: &str, send_amount: u64) -> TradeRequest {
    TradeRequest::new()
        .set_user(user_id)
        .set_trader(trader_id)
        .set_send("XAF", send_amount)
        .set_receive("NGN", send_amount * 2)
        .set_rate(2_000_000)
        .set_recipient(Recipient::new("Ngozi").with_method("mobile_money"))
}

/// Sink whose availability the test controls.
struct FlakySink {
    down: Arc<AtomicBool>,
}

impl LedgerSink for FlakySink {
    fn name(&self) -> &str {
        "flaky"
    }
    fn publish(&self, _: &Notification) -> anyhow::Result<()> {
        if self.down.load(Ordering::SeqCst) {
            anyhow::bail!("mirror unreachable");
        }
        Ok(())
    }
}

// TRADER ADMINISTRATION
mod trader_admin {
    use super::*;

    #[test]
    fn application_starts_pending_and_is_unique_per_user() {
        let service = service();
        let trader = service.apply_trader("user_1", vec![xaf_ngn()]).unwrap();

        assert_eq!(trader.status, TraderStatus::Pending);
        assert_eq!(trader.bond.total(), 0);
        assert!(trader.id.starts_with("trader_1"));
        assert_eq!(
            service.apply_trader("user_1", vec![]).unwrap_err(),
            ExchangeError::AlreadyApplied("user_1".into())
        );
        assert_eq!(service.trader_by_user("user_1").unwrap(), Some(trader));
        assert_eq!(service.trader_by_user("user_2").unwrap(), None);
    }

    #[test]
    fn invalid_corridors_are_rejected_on_application() {
        let service = service();
        let err = service
            .apply_trader("user_1", vec![xaf_ngn(), xaf_ngn()])
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Validation(_)));
    }

    #[test]
    fn approve_reject_and_suspend() {
        let service = service();
        let trader = service.apply_trader("user_1", vec![xaf_ngn()]).unwrap();

        let approved = service.approve_trader(&trader.id, "admin_1").unwrap();
        assert_eq!(approved.status, TraderStatus::Active);
        assert_eq!(approved.approved_by.as_deref(), Some("admin_1"));
        assert!(approved.approved_at.is_some());

        assert!(matches!(
            service.reject_trader(&trader.id, "too late"),
            Err(ExchangeError::InvalidTraderState { .. })
        ));

        service.set_trader_online(&trader.id, true).unwrap();
        let suspended = service.suspend_trader(&trader.id, "chargeback").unwrap();
        assert_eq!(suspended.status, TraderStatus::Suspended);
        assert!(!suspended.is_online);
        assert_eq!(suspended.status_reason.as_deref(), Some("chargeback"));

        assert!(matches!(
            service.set_trader_online(&trader.id, true),
            Err(ExchangeError::InvalidTraderState { .. })
        ));

        let reinstated = service.approve_trader(&trader.id, "admin_2").unwrap();
        assert_eq!(reinstated.status, TraderStatus::Active);
        assert_eq!(reinstated.status_reason, None);

        let other = service.apply_trader("user_2", vec![]).unwrap();
        let rejected = service.reject_trader(&other.id, "incomplete kyc").unwrap();
        assert_eq!(rejected.status, TraderStatus::Rejected);
    }

    #[test]
    fn suspended_trader_cannot_accept() {
        let service = service();
        let trader = active_trader(&service, "user_t", 1_000);
        let trade = service.create_trade(request("user_u", &trader.id, 100)).unwrap();

        service.suspend_trader(&trader.id, "review").unwrap();

        assert_eq!(
            service.accept_trade(&trade.id, &trader.id).unwrap_err(),
            ExchangeError::TraderInactive(trader.id.clone())
        );
        assert!(matches!(
            service.create_trade(request("user_u", &trader.id, 100)),
            Err(ExchangeError::TraderInactive(_))
        ));
    }

    #[test]
    fn traders_cannot_trade_with_themselves() {
        let service = service();
        let trader = active_trader(&service, "user_t", 1_000);

        assert!(matches!(
            service.create_trade(request("user_t", &trader.id, 100)),
            Err(ExchangeError::Validation(_))
        ));
    }
}

// BOND ADMINISTRATION
mod bond_admin {
    use super::*;

    #[test]
    fn withdrawals_are_limited_to_available_bond() {
        let service = service();
        let trader = active_trader(&service, "user_t", 1_000);
        let trade = service.create_trade(request("user_u", &trader.id, 700)).unwrap();
        service.accept_trade(&trade.id, &trader.id).unwrap();

        assert_eq!(
            service.withdraw_bond(&trader.id, 301).unwrap_err(),
            ExchangeError::InsufficientBond {
                available: 300,
                required: 301
            }
        );

        let trader = service.withdraw_bond(&trader.id, 300).unwrap();
        assert_eq!(trader.bond.total(), 700);
        assert_eq!(trader.bond.available(), 0);
    }

    #[test]
    fn audit_log_records_every_movement() {
        let service = service();
        let trader = active_trader(&service, "user_t", 1_000);
        let trade = service.create_trade(request("user_u", &trader.id, 250)).unwrap();
        service.accept_trade(&trade.id, &trader.id).unwrap();
        service.cancel_trade(&trade.id, "user_u").unwrap();
        service.withdraw_bond(&trader.id, 100).unwrap();

        let events = service.bond_events(&trader.id).unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                BondEventKind::Deposit,
                BondEventKind::Lock,
                BondEventKind::Unlock,
                BondEventKind::Withdraw
            ]
        );
        assert_eq!(events[1].trade_id.as_deref(), Some(trade.id.as_str()));
        assert_eq!((events[1].total_after, events[1].locked_after), (1_000, 250));
        assert_eq!(events[3].total_after, 900);

        assert!(matches!(
            service.bond_events("trader_missing"),
            Err(ExchangeError::TraderNotFound(_))
        ));
    }

    #[test]
    fn collateral_ratio_scales_the_lock() {
        let config = ExchangeConfig::new().set_collateral_ratio_bps(15_000);
        let service = TradeService::temporary(config).unwrap();
        let trader = active_trader(&service, "user_t", 1_000);
        let trade = service.create_trade(request("user_u", &trader.id, 401)).unwrap();

        let accepted = service.accept_trade(&trade.id, &trader.id).unwrap();
        assert_eq!(accepted.bond_locked, 602);
    }

    #[test]
    fn invalid_config_is_refused() {
        let config = ExchangeConfig::new().set_collateral_ratio_bps(0);
        assert!(matches!(
            TradeService::temporary(config),
            Err(ExchangeError::Validation(_))
        ));
    }
}

// NOTIFICATIONS
mod notifications {
    use super::*;

    #[test]
    fn committed_transitions_reach_registered_sinks() {
        let mut service = service();
        let (tx, rx) = mpsc::channel();
        service.register_sink(Box::new(ChannelSink::new("ws-room", tx)));
        service.register_sink(Box::new(TracingSink));

        let trader = active_trader(&service, "user_t", 1_000);
        let trade = service.create_trade(request("user_u", &trader.id, 300)).unwrap();
        service.accept_trade(&trade.id, &trader.id).unwrap();

        let created = rx.recv().unwrap();
        assert_eq!(created.trade_id, trade.id);
        assert_eq!(
            created.event,
            LedgerEvent::TradeCreated {
                send_amount: 300,
                receive_amount: 600
            }
        );
        let accepted = rx.recv().unwrap();
        assert_eq!(accepted.status, TradeStatus::Accepted);
        assert_eq!(accepted.event, LedgerEvent::TradeAccepted { bond_locked: 300 });

        assert!(service.pending_notifications().unwrap().is_empty());
    }

    #[test]
    fn rejected_transitions_notify_nobody() {
        let mut service = service();
        let (tx, rx) = mpsc::channel();
        service.register_sink(Box::new(ChannelSink::new("ws-room", tx)));

        let trader = active_trader(&service, "user_t", 1_000);
        let trade = service.create_trade(request("user_u", &trader.id, 300)).unwrap();
        rx.recv().unwrap();

        assert!(service.complete_trade(&trade.id, "user_u").is_err());
        assert!(rx.try_recv().is_err());
        assert!(service.pending_notifications().unwrap().is_empty());
    }

    #[test]
    fn failed_delivery_stays_in_the_outbox_until_retried() {
        let mut service = service();
        let down = Arc::new(AtomicBool::new(true));
        service.register_sink(Box::new(FlakySink { down: down.clone() }));

        let trader = active_trader(&service, "user_t", 1_000);
        // the mirror failing does not undo the commit
        let trade = service.create_trade(request("user_u", &trader.id, 300)).unwrap();
        assert_eq!(service.trade(&trade.id).unwrap().status, TradeStatus::Pending);

        let pending = service.pending_notifications().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].last_error.as_deref().unwrap().contains("mirror unreachable"));

        let report = service.retry_pending_notifications().unwrap();
        assert_eq!((report.delivered, report.failed), (0, 1));
        assert_eq!(service.pending_notifications().unwrap()[0].attempts, 2);

        down.store(false, Ordering::SeqCst);
        let report = service.retry_pending_notifications().unwrap();
        assert_eq!((report.delivered, report.failed), (1, 0));
        assert!(service.pending_notifications().unwrap().is_empty());
    }

    #[test]
    fn exhausted_notifications_are_reported_not_dropped() {
        let config = ExchangeConfig::new().set_max_notification_attempts(2);
        let mut service = TradeService::temporary(config).unwrap();
        service.register_sink(Box::new(FlakySink {
            down: Arc::new(AtomicBool::new(true)),
        }));

        let trader = active_trader(&service, "user_t", 1_000);
        service.create_trade(request("user_u", &trader.id, 300)).unwrap();

        let report = service.retry_pending_notifications().unwrap();
        assert_eq!(report.exhausted, 1);

        let pending = service.pending_notifications().unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].is_exhausted(2));
    }

    #[test]
    fn unreadable_outbox_is_an_error_not_an_empty_report() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let service = TradeService::new(Arc::new(db.clone())).unwrap();
        db.open_tree("outbox")
            .unwrap()
            .insert([0u8; 16], &b"not a notification"[..])
            .unwrap();

        assert!(service.retry_pending_notifications().is_err());
    }

    #[test]
    fn dispute_resolution_is_published_with_amounts() {
        let mut service = service();
        let (tx, rx) = mpsc::channel();
        service.register_sink(Box::new(ChannelSink::new("chain", tx)));

        let trader = active_trader(&service, "user_t", 1_000);
        let trade = service.create_trade(request("user_u", &trader.id, 9)).unwrap();
        service.accept_trade(&trade.id, &trader.id).unwrap();
        let dispute = service.open_dispute(&trade.id, "user_u", "short paid").unwrap();
        service
            .resolve_dispute(&dispute.id, "arbiter_1", Resolution::Split, None)
            .unwrap();

        let last = rx.try_iter().last().unwrap();
        assert_eq!(
            last.event,
            LedgerEvent::DisputeResolved {
                dispute_id: dispute.id,
                resolution: Resolution::Split,
                forfeited: 5,
                unlocked: 4
            }
        );
        assert_eq!(last.status, TradeStatus::Completed);
    }
}

// DISPUTE EVIDENCE
mod evidence {
    use super::*;

    #[test]
    fn participants_attach_evidence_while_open() {
        let service = service();
        let trader = active_trader(&service, "user_t", 1_000);
        let trade = service.create_trade(request("user_u", &trader.id, 100)).unwrap();
        service.accept_trade(&trade.id, &trader.id).unwrap();
        let dispute = service.open_dispute(&trade.id, &trader.id, "no payment").unwrap();

        service
            .submit_evidence(&dispute.id, "user_u", "uploads/receipt-1.jpg", Some("bank receipt"))
            .unwrap();
        let dispute = service
            .submit_evidence(&dispute.id, &trader.id, "uploads/statement.pdf", None)
            .unwrap();

        let parties: Vec<_> = dispute.evidence.iter().map(|e| e.party).collect();
        assert_eq!(parties, vec![Party::User, Party::Trader]);
        assert!(matches!(
            service.submit_evidence(&dispute.id, "user_x", "uploads/x.png", None),
            Err(ExchangeError::NotParticipant(_))
        ));

        service
            .resolve_dispute(&dispute.id, "arbiter_1", Resolution::FavorTrader, None)
            .unwrap();
        assert!(matches!(
            service.submit_evidence(&dispute.id, "user_u", "uploads/late.png", None),
            Err(ExchangeError::AlreadyResolved(_))
        ));
    }
}

// QUERIES
mod queries {
    use super::*;

    #[test]
    fn trade_listings_filter_and_paginate_newest_first() {
        let service = service();
        let trader = active_trader(&service, "user_t", 10_000);
        let ids: Vec<_> = (1..=4)
            .map(|n| service.create_trade(request("user_u", &trader.id, n * 100)).unwrap().id)
            .collect();
        service.create_trade(request("user_other", &trader.id, 100)).unwrap();
        service.decline_trade(&ids[0], &trader.id).unwrap();

        let all = service
            .list_trades_for_user("user_u", &TradeFilter::new())
            .unwrap();
        assert_eq!(all.total, 4);
        assert_eq!(all.items[0].id, ids[3]);

        let pending = TradeFilter::new().set_status(TradeStatus::Pending).set_page(2, 1);
        let page = service.list_trades_for_user("user_u", &pending).unwrap();
        assert_eq!(page.total, 3);
        let page_ids: Vec<_> = page.items.iter().map(|t| t.id.clone()).collect();
        assert_eq!(page_ids, vec![ids[2].clone(), ids[1].clone()]);

        let for_trader = service
            .list_trades_for_trader(&trader.id, &TradeFilter::new())
            .unwrap();
        assert_eq!(for_trader.total, 5);
    }

    #[test]
    fn trader_listing_filters() {
        let service = service();
        let online = active_trader(&service, "user_a", 1_000);
        service.set_trader_online(&online.id, true).unwrap();

        let offline = service.apply_trader("user_b", vec![]).unwrap();
        service.approve_trader(&offline.id, "admin_1").unwrap();
        service.apply_trader("user_c", vec![xaf_ngn()]).unwrap();

        assert_eq!(service.list_traders(&TraderFilter::new()).unwrap().total, 2);

        let page = service
            .list_traders(&TraderFilter::new().set_online(true))
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, online.id);

        let xaf = CurrencyCode::parse("XAF").unwrap();
        let ngn = CurrencyCode::parse("NGN").unwrap();
        let by_corridor = service
            .list_traders(&TraderFilter::new().set_corridor(xaf, ngn))
            .unwrap();
        assert_eq!(by_corridor.total, 1);

        let pending = service
            .list_traders(&TraderFilter::new().set_status(TraderStatus::Pending))
            .unwrap();
        assert_eq!(pending.items[0].user_id, "user_c");
    }

    #[test]
    fn disputes_overview_and_stats() {
        let service = service();
        let trader = active_trader(&service, "user_t", 1_000);

        let a = service.create_trade(request("user_u", &trader.id, 100)).unwrap();
        let b = service.create_trade(request("user_u", &trader.id, 200)).unwrap();
        service.create_trade(request("user_u", &trader.id, 300)).unwrap();
        service.accept_trade(&a.id, &trader.id).unwrap();
        service.accept_trade(&b.id, &trader.id).unwrap();

        let first = service.open_dispute(&a.id, "user_u", "late").unwrap();
        service.open_dispute(&b.id, "user_u", "wrong account").unwrap();
        service
            .resolve_dispute(&first.id, "arbiter_1", Resolution::FavorUser, None)
            .unwrap();

        assert_eq!(service.list_disputes(None).unwrap().len(), 2);
        let open = service.list_disputes(Some(DisputeStatus::Open)).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].trade_id, b.id);

        let overview = service.bond_overview().unwrap();
        assert_eq!(overview.traders, 1);
        assert_eq!(overview.total_deposited, 900);
        assert_eq!(overview.total_locked, 200);
        assert_eq!(overview.total_available, 700);

        let stats = service.stats().unwrap();
        assert_eq!(stats.trades(TradeStatus::Pending), 1);
        assert_eq!(stats.trades(TradeStatus::Disputed), 1);
        assert_eq!(stats.trades(TradeStatus::Cancelled), 1);
        assert_eq!(stats.traders(TraderStatus::Active), 1);
        assert_eq!((stats.disputes_open, stats.disputes_resolved), (1, 1));
    }
}
