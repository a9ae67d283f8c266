use anyhow::{Context, Result, bail};
use ethers::types::U256;
use rust_decimal::Decimal;

use crate::models::PairRef;
use crate::registry::ChainClient;

/// Fractional digits kept when converting raw token amounts to decimals.
pub const WORKING_SCALE: u32 = 18;

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("amount {0} does not fit a 96-bit decimal mantissa")]
    Overflow(U256),
}

/// Converts a raw on-chain amount into a `Decimal`, scaling by the token's
/// `decimals`. Keeps up to [`WORKING_SCALE`] fractional digits; when the
/// magnitude is too large for full precision the scale is reduced digit by
/// digit, and only a value that cannot be represented at all is an error.
pub fn decimal_from_units(amount: U256, decimals: u32) -> Result<Decimal, ConversionError> {
    let max_mantissa = U256::from(Decimal::MAX.mantissa() as u128);

    let mut scale = decimals.min(WORKING_SCALE);
    let mut value = amount / U256::exp10((decimals - scale) as usize);
    while value > max_mantissa && scale > 0 {
        value /= U256::from(10u64);
        scale -= 1;
    }
    if value > max_mantissa {
        return Err(ConversionError::Overflow(amount));
    }

    Ok(Decimal::from_i128_with_scale(value.as_u128() as i128, scale))
}

/// Current exchange rate of a pool: reserve1 per reserve0, both sides scaled
/// by their token's decimals. Pure read; chain errors propagate to the caller,
/// which treats a failed sample as "exclude this DEX from the round".
pub async fn sample_price(chain: &dyn ChainClient, pair: &PairRef) -> Result<Decimal> {
    let (reserve0, reserve1) = chain.pair_reserves(pair.blockchain_id, pair.address).await?;

    let reserve0 = decimal_from_units(reserve0, pair.token0_decimals)?;
    let reserve1 = decimal_from_units(reserve1, pair.token1_decimals)?;
    if reserve0.is_zero() {
        bail!("pool {:?} holds no token0 reserves", pair.address);
    }

    reserve1
        .checked_div(reserve0)
        .with_context(|| format!("price overflow for pool {:?}", pair.address))
}
