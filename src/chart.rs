//! Terminal candlestick chart with MA(5) and MA(10) overlays.

use anyhow::Result;
use chrono::Local;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::models::Candle;
use crate::monitor::ChartUpdate;

const BULL_BODY: char = '█';
const BEAR_BODY: char = '░';
const WICK: char = '│';
const MA_FAST_MARK: char = '•';
const MA_SLOW_MARK: char = '·';

/// Price label plus separator in front of each row.
const LABEL_CELLS: usize = 14;

pub const MA_FAST: usize = 5;
pub const MA_SLOW: usize = 10;

/// Chart dimensions in terminal cells.
#[derive(Debug, Clone, Copy)]
pub struct ChartSize {
    /// Price rows
    pub height: usize,
    /// Most recent candles shown, one column each
    pub width: usize,
}

impl Default for ChartSize {
    fn default() -> Self {
        Self {
            height: 20,
            width: 80,
        }
    }
}

/// Simple moving average of closes; `None` until `period` candles exist.
pub fn moving_average(candles: &[Candle], period: usize) -> Vec<Option<Decimal>> {
    if period == 0 {
        return vec![None; candles.len()];
    }

    let mut sum = Decimal::ZERO;
    candles
        .iter()
        .enumerate()
        .map(|(i, candle)| {
            sum += candle.close;
            if i >= period {
                sum -= candles[i - period].close;
            }
            (i + 1 >= period).then(|| sum / Decimal::from(period))
        })
        .collect()
}

/// Render a full chart for `update`, title first.
pub fn render(update: &ChartUpdate, size: ChartSize) -> Result<String> {
    if update.candles.is_empty() {
        anyhow::bail!("No candle data for {} {}", update.symbol, update.timeframe);
    }

    let mut out = String::new();
    out.push_str(&update.title());
    out.push('\n');
    out.push_str(&render_candles(&update.candles, size));
    Ok(out)
}

/// Body of the chart: price rows, time axis and MA legend.
pub fn render_candles(candles: &[Candle], size: ChartSize) -> String {
    let height = size.height.max(2);
    let start = candles.len().saturating_sub(size.width.max(1));

    // Averages use the full history so the first visible columns are defined
    let fast = moving_average(candles, MA_FAST);
    let slow = moving_average(candles, MA_SLOW);

    let visible = &candles[start..];
    let fast = &fast[start..];
    let slow = &slow[start..];

    let (mut lo, mut hi) = (visible[0].low, visible[0].high);
    for candle in visible {
        lo = lo.min(candle.low);
        hi = hi.max(candle.high);
    }
    for value in fast.iter().chain(slow.iter()).flatten() {
        lo = lo.min(*value);
        hi = hi.max(*value);
    }

    let mut grid = vec![vec![' '; visible.len()]; height];
    for (col, candle) in visible.iter().enumerate() {
        let body = if candle.is_bullish() { BULL_BODY } else { BEAR_BODY };
        let body_top = row_of(candle.open.max(candle.close), hi, lo, height);
        let body_bottom = row_of(candle.open.min(candle.close), hi, lo, height);

        for row in row_of(candle.high, hi, lo, height)..=row_of(candle.low, hi, lo, height) {
            grid[row][col] = if (body_top..=body_bottom).contains(&row) { body } else { WICK };
        }
    }
    for (series, mark) in [(slow, MA_SLOW_MARK), (fast, MA_FAST_MARK)] {
        for (col, value) in series.iter().enumerate() {
            if let Some(value) = value {
                let cell = &mut grid[row_of(*value, hi, lo, height)][col];
                if *cell == ' ' || *cell == MA_SLOW_MARK {
                    *cell = mark;
                }
            }
        }
    }

    let mut out = String::new();
    for (row, cells) in grid.iter().enumerate() {
        let line: String = cells.iter().collect();
        out.push_str(&format!("{:>12} ┤{}\n", price_at(row, hi, lo, height).round_dp(2), line));
    }
    out.push_str(&format!("{:>12} └{}\n", "", "─".repeat(visible.len())));

    let time = |c: &Candle| {
        c.open_datetime()
            .map(|t| t.with_timezone(&Local).format("%H:%M").to_string())
            .unwrap_or_default()
    };
    if let (Some(first), Some(last)) = (visible.first(), visible.last()) {
        let first = time(first);
        let last = time(last);
        let gap = visible.len().saturating_sub(first.len() + last.len()).max(1);
        out.push_str(&format!("{:>12}  {}{}{}\n", "", first, " ".repeat(gap), last));
    }

    let latest = |series: &[Option<Decimal>]| {
        series
            .last()
            .copied()
            .flatten()
            .map(|v| v.round_dp(2).to_string())
            .unwrap_or_else(|| "-".to_string())
    };
    out.push_str(&format!(
        "{} MA{} {}   {} MA{} {}   last close {}\n",
        MA_FAST_MARK,
        MA_FAST,
        latest(fast),
        MA_SLOW_MARK,
        MA_SLOW,
        latest(slow),
        visible[visible.len() - 1].close
    ));
    out
}

fn row_of(price: Decimal, hi: Decimal, lo: Decimal, height: usize) -> usize {
    if hi <= lo {
        return height / 2;
    }
    let frac = (hi - price) / (hi - lo);
    (frac * Decimal::from(height - 1))
        .round()
        .to_usize()
        .unwrap_or(0)
        .min(height - 1)
}

fn price_at(row: usize, hi: Decimal, lo: Decimal, height: usize) -> Decimal {
    hi - (hi - lo) * Decimal::from(row) / Decimal::from(height - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Timeframe;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn candle(t: i64, open: Decimal, close: Decimal) -> Candle {
        Candle {
            open_time: t * 60_000,
            open,
            high: open.max(close) + dec!(1),
            low: open.min(close) - dec!(1),
            close,
            volume: dec!(1),
        }
    }

    fn rising(n: i64) -> Vec<Candle> {
        (0..n)
            .map(|i| candle(i, Decimal::from(100 + i), Decimal::from(101 + i)))
            .collect()
    }

    #[test]
    fn test_moving_average() {
        let candles = rising(6);
        let ma = moving_average(&candles, 5);

        assert_eq!(ma.len(), 6);
        assert!(ma[..4].iter().all(Option::is_none));
        // closes 101..=105
        assert_eq!(ma[4], Some(dec!(103)));
        // closes 102..=106
        assert_eq!(ma[5], Some(dec!(104)));
    }

    #[test]
    fn test_moving_average_short_history() {
        let ma = moving_average(&rising(3), 10);
        assert_eq!(ma, vec![None, None, None]);
    }

    #[test]
    fn test_render_rejects_empty_candles() {
        let update = ChartUpdate {
            exchange: "okx",
            symbol: "BTC/USDT".to_string(),
            timeframe: Timeframe::OneMinute,
            candles: Vec::new(),
            updated_at: Utc::now(),
        };
        assert!(render(&update, ChartSize::default()).is_err());
    }

    #[test]
    fn test_render_layout() {
        let update = ChartUpdate {
            exchange: "binance",
            symbol: "ETH/USDT".to_string(),
            timeframe: Timeframe::FiveMinutes,
            candles: rising(12),
            updated_at: Utc::now(),
        };
        let size = ChartSize { height: 10, width: 80 };
        let chart = render(&update, size).unwrap();
        let lines: Vec<&str> = chart.lines().collect();

        assert!(lines[0].starts_with("BINANCE ETH/USDT 5m (updated: "));
        // title + rows + axis + times + legend
        assert_eq!(lines.len(), 1 + 10 + 3);
        assert!(lines[11].contains('└'));
        assert!(lines[13].contains("MA5 110"));
    }

    #[test]
    fn test_rising_candles_climb() {
        let size = ChartSize { height: 12, width: 80 };
        let body = render_candles(&rising(8), size);
        let rows: Vec<Vec<char>> = body
            .lines()
            .take(12)
            .map(|l| l.chars().skip(LABEL_CELLS).collect())
            .collect();

        let top_body_row = |col: usize| rows.iter().position(|r| r.get(col) == Some(&BULL_BODY));
        let first = top_body_row(0).unwrap();
        let last = top_body_row(7).unwrap();
        assert!(last < first, "last candle should sit higher on the chart");
    }

    #[test]
    fn test_only_latest_candles_shown() {
        let size = ChartSize { height: 6, width: 4 };
        let body = render_candles(&rising(20), size);
        let first_row = body.lines().next().unwrap();
        assert_eq!(first_row.chars().skip(LABEL_CELLS).count(), 4);
    }
}
