use chrono::NaiveDate;
use otr_portfolio::{
    apply_batch, assign, compute_net_liquidation_value, delete_ledger_entry, expire, marks,
    record_short_option_trade, record_stock_trade, roll, AccessContext, AccessRole, Assignment,
    CashKind, CashMovement, Currency, EngineError, Expiration, FillOutcome, LotStatus, Micros,
    OptionTerms, OptionType, PortfolioBook, PositionKey, Roll, ShortOptionTrade, Side, StockTrade,
    TradeEvent,
};
use uuid::Uuid;

fn d(m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, m, day).unwrap()
}

fn stock(side: Side, qty: i64, date: NaiveDate) -> StockTrade {
    StockTrade {
        symbol: "AAPL".into(),
        quantity: qty,
        price: Micros::dollars(100),
        side,
        date,
        fees: Micros::ZERO,
    }
}

fn aapl_call(strike: i64) -> OptionTerms {
    OptionTerms {
        symbol: "AAPL".into(),
        option_type: OptionType::Call,
        strike: Micros::dollars(strike),
        expiration: d(6, 21),
    }
}

fn sell_to_open(terms: OptionTerms, contracts: i64, date: NaiveDate) -> ShortOptionTrade {
    ShortOptionTrade {
        terms,
        contracts,
        premium: Micros::dollars(2),
        side: Side::Sell,
        date,
        fees: Micros::ZERO,
        collateral_override: None,
    }
}

#[test]
fn scenario_delete_reverses_quantity_and_journals_it() {
    let owner = Uuid::from_u128(1);
    let ctx = AccessContext::owner(owner);
    let mut book = PortfolioBook::new(owner);

    record_stock_trade(&ctx, &mut book, &stock(Side::Buy, 10, d(1, 2))).unwrap();
    let sell = record_stock_trade(&ctx, &mut book, &stock(Side::Sell, 4, d(1, 3))).unwrap();
    book.take_journal();

    let r = delete_ledger_entry(&ctx, &mut book, sell.entries[0].id).unwrap();
    assert_eq!(r.entries.len(), 1);
    assert_eq!(
        book.longs().find(&PositionKey::stock("AAPL")).unwrap().quantity,
        10
    );
    assert_eq!(book.ledger().len(), 1);

    let j = book.take_journal();
    assert_eq!(j.ledger_deletes, vec![sell.entries[0].id]);
    assert_eq!(j.long_upserts.len(), 1);
    assert_eq!(j.long_upserts[0].quantity, 10);
}

#[test]
fn scenario_deleting_one_group_member_removes_the_group() {
    let owner = Uuid::from_u128(2);
    let ctx = AccessContext::owner(owner);
    let mut book = PortfolioBook::new(owner);

    let open = record_short_option_trade(
        &ctx,
        &mut book,
        &ShortOptionTrade {
            terms: OptionTerms {
                symbol: "AAPL".into(),
                option_type: OptionType::Put,
                strike: Micros::dollars(90),
                expiration: d(3, 15),
            },
            contracts: 1,
            premium: Micros::dollars(1),
            side: Side::Sell,
            date: d(2, 1),
            fees: Micros::ZERO,
            collateral_override: None,
        },
    )
    .unwrap();
    let assigned = assign(
        &ctx,
        &mut book,
        &Assignment {
            lot_id: open.lot_ids[0],
            contracts: 1,
            date: d(3, 15),
        },
    )
    .unwrap();
    assert_eq!(book.ledger().len(), 3);

    // Delete via the zero-amount marker; the stock leg goes too.
    let r = delete_ledger_entry(&ctx, &mut book, assigned.entries[0].id).unwrap();
    assert_eq!(r.entries.len(), 2);
    assert_eq!(r.fill, FillOutcome::Ok);
    assert_eq!(book.ledger().len(), 1);
    assert_eq!(
        book.longs().find(&PositionKey::stock("AAPL")).unwrap().quantity,
        0
    );

    let lot = book.shorts().get(open.lot_ids[0]).unwrap();
    assert_eq!(lot.status, LotStatus::Open);
    assert_eq!(lot.contracts, 1);
    assert_eq!(lot.closed_date, None);
    assert_eq!(book.shorts().lots().count(), 1);
}

#[test]
fn scenario_deleting_a_sell_to_open_removes_its_lot() {
    let owner = Uuid::from_u128(6);
    let ctx = AccessContext::owner(owner);
    let mut book = PortfolioBook::new(owner);

    let open = record_short_option_trade(&ctx, &mut book, &sell_to_open(aapl_call(150), 1, d(2, 1)))
        .unwrap();
    book.take_journal();

    delete_ledger_entry(&ctx, &mut book, open.entries[0].id).unwrap();
    assert!(book.ledger().is_empty());
    assert!(book.shorts().open_lots().is_empty());
    let nl = compute_net_liquidation_value(&book, &marks([("AAPL", Micros::dollars(160))]));
    assert_eq!(nl.itm_call_liability, Micros::ZERO);

    let j = book.take_journal();
    assert_eq!(j.short_deletes, open.lot_ids);
    assert!(j.short_upserts.is_empty());
}

#[test]
fn scenario_deleting_a_call_assignment_gives_back_shares_and_lot() {
    let owner = Uuid::from_u128(7);
    let ctx = AccessContext::owner(owner);
    let mut book = PortfolioBook::new(owner);

    record_stock_trade(&ctx, &mut book, &stock(Side::Buy, 100, d(1, 2))).unwrap();
    let open = record_short_option_trade(&ctx, &mut book, &sell_to_open(aapl_call(150), 1, d(2, 1)))
        .unwrap();
    let assigned = assign(
        &ctx,
        &mut book,
        &Assignment {
            lot_id: open.lot_ids[0],
            contracts: 1,
            date: d(6, 21),
        },
    )
    .unwrap();
    assert_eq!(
        book.longs().find(&PositionKey::stock("AAPL")).unwrap().quantity,
        0
    );

    delete_ledger_entry(&ctx, &mut book, assigned.entries[1].id).unwrap();
    assert_eq!(
        book.longs().find(&PositionKey::stock("AAPL")).unwrap().quantity,
        100
    );
    let lot = book.shorts().get(open.lot_ids[0]).unwrap();
    assert_eq!(lot.status, LotStatus::Open);
    assert!(lot.linked_asset_id.is_some());
}

#[test]
fn scenario_deleting_a_roll_reopens_the_old_lot() {
    let owner = Uuid::from_u128(8);
    let ctx = AccessContext::owner(owner);
    let mut book = PortfolioBook::new(owner);

    let open = record_short_option_trade(&ctx, &mut book, &sell_to_open(aapl_call(150), 2, d(2, 1)))
        .unwrap();
    let old_lot = open.lot_ids[0];
    let rolled = roll(
        &ctx,
        &mut book,
        &Roll {
            symbol: "AAPL".into(),
            option_type: OptionType::Call,
            contracts: 2,
            old_strike: Micros::dollars(150),
            old_expiration: d(6, 21),
            btc_price: Micros::dollars(3),
            new_strike: Micros::dollars(160),
            new_expiration: d(9, 20),
            new_premium: Micros::dollars(4),
            fees: Micros::ZERO,
            date: d(6, 1),
            collateral_override: None,
        },
    )
    .unwrap();
    let new_lot = *rolled.lot_ids.last().unwrap();
    assert_ne!(new_lot, old_lot);
    book.take_journal();

    let r = delete_ledger_entry(&ctx, &mut book, rolled.entries[0].id).unwrap();
    assert_eq!(r.entries.len(), 2);
    assert_eq!(r.fill, FillOutcome::Ok);
    assert!(book.shorts().get(new_lot).is_none());
    let lot = book.shorts().get(old_lot).unwrap();
    assert_eq!(lot.status, LotStatus::Open);
    assert_eq!(lot.contracts, 2);
    assert_eq!(lot.closing_price, None);

    let j = book.take_journal();
    assert_eq!(j.short_deletes, vec![new_lot]);
    assert_eq!(j.short_upserts.len(), 1);
    assert_eq!(j.short_upserts[0].id, old_lot);
}

#[test]
fn scenario_deleting_a_partial_expiry_merges_the_split_back() {
    let owner = Uuid::from_u128(9);
    let ctx = AccessContext::owner(owner);
    let mut book = PortfolioBook::new(owner);

    let open = record_short_option_trade(&ctx, &mut book, &sell_to_open(aapl_call(150), 3, d(2, 1)))
        .unwrap();
    let expired = expire(
        &ctx,
        &mut book,
        &Expiration {
            terms: aapl_call(150),
            contracts: 1,
            date: d(6, 21),
            fees: Micros::cents(65),
        },
    )
    .unwrap();
    assert_eq!(book.shorts().lots().count(), 2);

    // Deleting the fee entry takes the marker with it.
    let r = delete_ledger_entry(&ctx, &mut book, expired.entries[1].id).unwrap();
    assert_eq!(r.entries.len(), 2);
    assert_eq!(book.shorts().lots().count(), 1);
    let lot = book.shorts().get(open.lot_ids[0]).unwrap();
    assert_eq!(lot.status, LotStatus::Open);
    assert_eq!(lot.contracts, 3);
    assert_eq!(book.ledger().len(), 1);
}

#[test]
fn scenario_editor_may_write_viewer_may_not() {
    let owner = Uuid::from_u128(3);
    let mut book = PortfolioBook::new(owner);
    let editor = AccessContext::delegated(owner, Uuid::from_u128(30), AccessRole::Editor);
    let viewer = AccessContext::delegated(owner, Uuid::from_u128(31), AccessRole::Viewer);

    record_stock_trade(&editor, &mut book, &stock(Side::Buy, 1, d(1, 2))).unwrap();
    let id = book.ledger().entries()[0].id;
    assert!(matches!(
        delete_ledger_entry(&viewer, &mut book, id),
        Err(EngineError::ReadOnly { .. })
    ));
    assert_eq!(book.ledger().len(), 1);
}

#[test]
fn scenario_batch_applies_in_date_then_row_order() {
    let owner = Uuid::from_u128(4);
    let ctx = AccessContext::owner(owner);
    let mut book = PortfolioBook::new(owner);

    let events = vec![
        // Row 1 sells on the 5th; it must run after the buy on the 3rd.
        (1, TradeEvent::Stock(stock(Side::Sell, 5, d(1, 5)))),
        (2, TradeEvent::Stock(stock(Side::Buy, 5, d(1, 3)))),
        (3, TradeEvent::Stock(stock(Side::Buy, 0, d(1, 4)))),
        (
            4,
            TradeEvent::Cash(CashMovement {
                kind: CashKind::Deposit,
                amount: Micros::dollars(1_000),
                amount_cad_basis: Some(Micros::dollars(1_360)),
                symbol: None,
                date: d(1, 1),
                note: Some("opening".into()),
            }),
        ),
    ];

    let summary = apply_batch(&ctx, &mut book, events);
    assert_eq!(summary.applied, 3);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].row, 3);
    assert!(summary.warnings.is_empty(), "{:?}", summary.warnings);
    assert_eq!(summary.entries_written, 4);

    let dates: Vec<_> = book
        .ledger()
        .chronological()
        .iter()
        .map(|e| e.date)
        .collect();
    assert_eq!(dates, vec![d(1, 1), d(1, 1), d(1, 3), d(1, 5)]);
    assert_eq!(book.ledger().net_invested(Currency::Cad), Micros::dollars(1_360));
    assert_eq!(
        book.longs().find(&PositionKey::stock("AAPL")).unwrap().quantity,
        0
    );
}

#[test]
fn scenario_batch_reports_partial_fills_as_warnings() {
    let owner = Uuid::from_u128(5);
    let ctx = AccessContext::owner(owner);
    let mut book = PortfolioBook::new(owner);

    let summary = apply_batch(
        &ctx,
        &mut book,
        vec![(7, TradeEvent::Stock(stock(Side::Sell, 2, d(1, 2))))],
    );
    assert_eq!(summary.applied, 1);
    assert_eq!(summary.warnings.len(), 1);
    assert!(matches!(
        summary.warnings[0].outcome,
        FillOutcome::Inconsistent { .. }
    ));
    assert!(!summary.is_clean());
}
