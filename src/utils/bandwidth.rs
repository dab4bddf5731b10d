//! Token-bucket rate accounting for multicast traffic.
//!
//! Each multicast group on a network gets its own [`BandwidthAccount`],
//! created the first time the group is used, with parameters taken from the
//! network's multicast rate policy.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::core::address::MulticastGroup;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Rate policy for one multicast group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MulticastRate {
    /// Initial balance in bytes
    pub preload: u32,
    /// Balance ceiling in bytes
    pub max_balance: u32,
    /// Bytes credited per second
    pub accrual: u32,
}

impl MulticastRate {
    pub const fn new(preload: u32, max_balance: u32, accrual: u32) -> Self {
        Self {
            preload,
            max_balance,
            accrual,
        }
    }
}

impl Default for MulticastRate {
    fn default() -> Self {
        // 32 KiB burst, 32 KiB/s sustained
        Self::new(32768, 32768, 32768)
    }
}

#[derive(Debug, Clone)]
pub struct BandwidthAccount {
    balance: u64,
    max_balance: u64,
    accrual: u64,
    last_update: Instant,
}

impl BandwidthAccount {
    pub fn new(rate: MulticastRate) -> Self {
        Self::starting_at(rate, Instant::now())
    }

    pub fn starting_at(rate: MulticastRate, now: Instant) -> Self {
        Self {
            balance: u64::from(rate.preload.min(rate.max_balance)),
            max_balance: u64::from(rate.max_balance),
            accrual: u64::from(rate.accrual),
            last_update: now,
        }
    }

    fn update(&mut self, now: Instant) {
        if self.accrual == 0 {
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_update);
        let elapsed_ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        let credit = elapsed_ns.saturating_mul(self.accrual) / NANOS_PER_SEC;
        if credit == 0 {
            return;
        }
        let balance = self.balance.saturating_add(credit);
        if balance >= self.max_balance {
            self.balance = self.max_balance;
            self.last_update = now;
        } else {
            self.balance = balance;
            // only the time that became whole bytes is consumed
            let spent_ns = credit.saturating_mul(NANOS_PER_SEC).div_ceil(self.accrual);
            self.last_update += Duration::from_nanos(spent_ns);
        }
    }

    /// Deduct `bytes` if the balance covers them. A rejected send leaves the
    /// balance untouched.
    pub fn deduct_at(&mut self, bytes: usize, now: Instant) -> bool {
        self.update(now);
        let bytes = bytes as u64;
        if self.balance >= bytes {
            self.balance -= bytes;
            true
        } else {
            false
        }
    }

    pub fn deduct(&mut self, bytes: usize) -> bool {
        self.deduct_at(bytes, Instant::now())
    }

    pub fn balance(&self) -> u64 {
        self.balance
    }
}

/// Lazily populated accounts, one per multicast group.
#[derive(Debug, Default)]
pub struct MulticastRateAccounts {
    accounts: BTreeMap<MulticastGroup, BandwidthAccount>,
}

impl MulticastRateAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Charge `bytes` against `group`, creating its account from `rate` on
    /// first use.
    pub fn update_and_check(&mut self, group: &MulticastGroup, bytes: usize, rate: MulticastRate) -> bool {
        self.accounts
            .entry(*group)
            .or_insert_with(|| BandwidthAccount::new(rate))
            .deduct(bytes)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Forget every account, e.g. after the rate policy changed.
    pub fn clear(&mut self) {
        self.accounts.clear();
    }
}
