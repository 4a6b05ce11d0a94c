use chrono::NaiveDate;
use otr_portfolio::{
    record_long_option_trade, record_stock_trade, AccessContext, FillOutcome, InstrumentType,
    LedgerKind, LongOptionTrade, Micros, OptionTerms, OptionType, PortfolioBook, PositionKey,
    Side, StockTrade,
};
use uuid::Uuid;

fn d(m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, m, day).unwrap()
}

fn trade(side: Side, qty: i64, price: Micros, fees: Micros, date: NaiveDate) -> StockTrade {
    StockTrade {
        symbol: "AAPL".into(),
        quantity: qty,
        price,
        side,
        date,
        fees,
    }
}

#[test]
fn scenario_weighted_average_cost_of_two_buys() {
    let owner = Uuid::from_u128(1);
    let ctx = AccessContext::owner(owner);
    let mut book = PortfolioBook::new(owner);

    record_stock_trade(&ctx, &mut book, &trade(Side::Buy, 10, Micros::dollars(100), Micros::ZERO, d(1, 2))).unwrap();
    record_stock_trade(&ctx, &mut book, &trade(Side::Buy, 10, Micros::dollars(200), Micros::ZERO, d(1, 3))).unwrap();

    let pos = book.longs().find(&PositionKey::stock("AAPL")).expect("AAPL row");
    assert_eq!(pos.quantity, 20);
    assert_eq!(pos.cost_basis, Micros::dollars(150));
    assert_eq!(pos.date_acquired, d(1, 2));
}

#[test]
fn scenario_inventory_conservation_over_mixed_trades() {
    let owner = Uuid::from_u128(2);
    let ctx = AccessContext::owner(owner);
    let mut book = PortfolioBook::new(owner);

    let seq = [
        (Side::Buy, 30),
        (Side::Sell, 5),
        (Side::Buy, 12),
        (Side::Sell, 20),
        (Side::Sell, 7),
        (Side::Buy, 1),
    ];
    let mut expected = 0;
    for (i, (side, qty)) in seq.iter().enumerate() {
        record_stock_trade(
            &ctx,
            &mut book,
            &trade(*side, *qty, Micros::dollars(50 + i as i64), Micros::cents(100), d(2, 1 + i as u32)),
        )
        .unwrap();
        expected += match side {
            Side::Buy => *qty,
            Side::Sell => -*qty,
        };
    }

    let pos = book.longs().find(&PositionKey::stock("AAPL")).unwrap();
    assert_eq!(pos.quantity, expected);
    assert_eq!(expected, 11);
    assert_eq!(book.ledger().len(), seq.len());
}

#[test]
fn scenario_ledger_signs_follow_side() {
    let owner = Uuid::from_u128(3);
    let ctx = AccessContext::owner(owner);
    let mut book = PortfolioBook::new(owner);

    record_stock_trade(&ctx, &mut book, &trade(Side::Buy, 4, Micros::dollars(25), Micros::dollars(1), d(3, 1))).unwrap();
    record_stock_trade(&ctx, &mut book, &trade(Side::Sell, 2, Micros::dollars(30), Micros::dollars(1), d(3, 2))).unwrap();

    let entries = book.ledger().entries();
    assert_eq!(entries[0].amount, Micros::dollars(-101));
    assert_eq!(entries[0].amount.signum(), -1);
    assert_eq!(entries[1].amount, Micros::dollars(59));
    assert_eq!(entries[1].amount.signum(), 1);
    assert!(entries.iter().all(|e| e.kind == LedgerKind::TradeStock));
    assert!(book.ledger().verify_integrity());
}

#[test]
fn scenario_selling_everything_keeps_cost_and_hides_row() {
    let owner = Uuid::from_u128(4);
    let ctx = AccessContext::owner(owner);
    let mut book = PortfolioBook::new(owner);

    record_stock_trade(&ctx, &mut book, &trade(Side::Buy, 10, Micros::dollars(10), Micros::ZERO, d(4, 1))).unwrap();
    let r = record_stock_trade(&ctx, &mut book, &trade(Side::Sell, 10, Micros::dollars(12), Micros::ZERO, d(4, 2))).unwrap();
    assert_eq!(r.fill, FillOutcome::Ok);

    assert_eq!(book.longs().active().count(), 0);
    let row = book.longs().find(&PositionKey::stock("AAPL")).unwrap();
    assert_eq!(row.quantity, 0);
    assert_eq!(row.cost_basis, Micros::dollars(10));

    // Buying back in after flat starts a fresh average.
    record_stock_trade(&ctx, &mut book, &trade(Side::Buy, 5, Micros::dollars(20), Micros::ZERO, d(4, 3))).unwrap();
    let row = book.longs().find(&PositionKey::stock("AAPL")).unwrap();
    assert_eq!(row.cost_basis, Micros::dollars(20));
}

#[test]
fn scenario_leap_basis_is_per_share_with_fees_spread() {
    let owner = Uuid::from_u128(5);
    let ctx = AccessContext::owner(owner);
    let mut book = PortfolioBook::new(owner);
    let terms = OptionTerms {
        symbol: "sofi".into(),
        option_type: OptionType::Call,
        strike: Micros::dollars(10),
        expiration: NaiveDate::from_ymd_opt(2026, 1, 16).unwrap(),
    };

    let r = record_long_option_trade(
        &ctx,
        &mut book,
        &LongOptionTrade {
            terms: terms.clone(),
            contracts: 2,
            premium: Micros::dollars(3),
            side: Side::Buy,
            date: d(5, 1),
            fees: Micros::dollars(2),
        },
    )
    .unwrap();
    assert_eq!(r.entries[0].kind, LedgerKind::TradeLeapCall);
    assert_eq!(r.entries[0].amount, Micros::dollars(-602));

    record_long_option_trade(
        &ctx,
        &mut book,
        &LongOptionTrade {
            terms,
            contracts: 2,
            premium: Micros::dollars(5),
            side: Side::Buy,
            date: d(5, 2),
            fees: Micros::ZERO,
        },
    )
    .unwrap();

    let pos = book.longs().active().next().unwrap();
    assert_eq!(pos.instrument_type, InstrumentType::LeapCall);
    assert_eq!(pos.symbol, "SOFI");
    assert_eq!(pos.quantity, 4);
    // (2*3.00*100 + 2 + 2*5.00*100) / (4*100) = 4.005
    assert_eq!(pos.cost_basis, Micros::new(4_005_000));
}
