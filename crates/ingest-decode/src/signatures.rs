//! Event ABIs for the builtin signature set.
//!
//! Declared with `alloy::sol!` so topic0 hashes are computed at compile time
//! from the canonical signature instead of being copied around as hex.

pub mod erc20 {
    alloy::sol! {
        interface IERC20 {
            event Transfer(address indexed from, address indexed to, uint256 value);
        }
    }
}

pub mod erc721 {
    alloy::sol! {
        /// Same canonical signature as ERC-20 Transfer, with tokenId indexed.
        interface IERC721 {
            event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);
        }
    }
}

pub mod erc1155 {
    alloy::sol! {
        interface IERC1155 {
            event TransferSingle(
                address indexed operator,
                address indexed from,
                address indexed to,
                uint256 id,
                uint256 value
            );
            event TransferBatch(
                address indexed operator,
                address indexed from,
                address indexed to,
                uint256[] ids,
                uint256[] values
            );
        }
    }
}

pub mod uniswap_v2 {
    alloy::sol! {
        interface IUniswapV2Pair {
            event Swap(
                address indexed sender,
                uint256 amount0In,
                uint256 amount1In,
                uint256 amount0Out,
                uint256 amount1Out,
                address indexed to
            );
            event Mint(address indexed sender, uint256 amount0, uint256 amount1);
            event Burn(address indexed sender, uint256 amount0, uint256 amount1, address indexed to);
        }
    }
}

pub mod uniswap_v3 {
    alloy::sol! {
        interface IUniswapV3Pool {
            event Swap(
                address indexed sender,
                address indexed recipient,
                int256 amount0,
                int256 amount1,
                uint160 sqrtPriceX96,
                uint128 liquidity,
                int24 tick
            );
            event Mint(
                address sender,
                address indexed owner,
                int24 indexed tickLower,
                int24 indexed tickUpper,
                uint128 amount,
                uint256 amount0,
                uint256 amount1
            );
            event Burn(
                address indexed owner,
                int24 indexed tickLower,
                int24 indexed tickUpper,
                uint128 amount,
                uint256 amount0,
                uint256 amount1
            );
        }
    }
}

pub mod aave_v2 {
    alloy::sol! {
        interface ILendingPool {
            event Deposit(
                address indexed reserve,
                address user,
                address indexed onBehalfOf,
                uint256 amount,
                uint16 indexed referral
            );
            event Withdraw(address indexed reserve, address indexed user, address indexed to, uint256 amount);
            event Borrow(
                address indexed reserve,
                address user,
                address indexed onBehalfOf,
                uint256 amount,
                uint256 borrowRateMode,
                uint256 borrowRate,
                uint16 indexed referral
            );
            event Repay(address indexed reserve, address indexed user, address indexed repayer, uint256 amount);
        }
    }
}

pub mod compound {
    alloy::sol! {
        /// cToken market events. `Mint` shares its topic0 with Uniswap V2 `Mint`.
        interface ICToken {
            event Mint(address minter, uint256 mintAmount, uint256 mintTokens);
            event Redeem(address redeemer, uint256 redeemAmount, uint256 redeemTokens);
            event Borrow(address borrower, uint256 borrowAmount, uint256 accountBorrows, uint256 totalBorrows);
            event RepayBorrow(
                address payer,
                address borrower,
                uint256 repayAmount,
                uint256 accountBorrows,
                uint256 totalBorrows
            );
        }
    }
}

pub mod staking {
    alloy::sol! {
        interface IStakingRewards {
            event Staked(address indexed user, uint256 amount);
            event Withdrawn(address indexed user, uint256 amount);
            event RewardPaid(address indexed user, uint256 reward);
        }
    }
}

pub mod masterchef {
    alloy::sol! {
        interface IMasterChef {
            event Deposit(address indexed user, uint256 indexed pid, uint256 amount);
            event Withdraw(address indexed user, uint256 indexed pid, uint256 amount);
            event Harvest(address indexed user, uint256 indexed pid, uint256 amount);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::b256;
    use alloy::sol_types::SolEvent;

    #[test]
    fn computed_hashes_match_known_topics() {
        assert_eq!(
            erc20::IERC20::Transfer::SIGNATURE_HASH,
            b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef")
        );
        assert_eq!(
            erc721::IERC721::Transfer::SIGNATURE_HASH,
            erc20::IERC20::Transfer::SIGNATURE_HASH
        );
        assert_eq!(
            uniswap_v2::IUniswapV2Pair::Swap::SIGNATURE_HASH,
            b256!("d78ad95fa46c994b6551d0da85fc275fe613ce37657fb8d5e3d130840159d822")
        );
        assert_eq!(
            uniswap_v3::IUniswapV3Pool::Swap::SIGNATURE_HASH,
            b256!("c42079f94a6350d7e6235f29174924f928cc2ac818eb64fed8004e115fbcca67")
        );
        assert_eq!(
            erc1155::IERC1155::TransferSingle::SIGNATURE_HASH,
            b256!("c3d58168c5ae7397731d063d5bbf3d657854427343f4c083240f7aacaa2d0f62")
        );
        assert_eq!(
            aave_v2::ILendingPool::Deposit::SIGNATURE_HASH,
            b256!("de6857219544bb5b7746f48ed30be6386fefc61b2f864cacf559893bf50fd951")
        );
    }

    #[test]
    fn compound_and_uniswap_mint_collide() {
        assert_eq!(
            compound::ICToken::Mint::SIGNATURE_HASH,
            uniswap_v2::IUniswapV2Pair::Mint::SIGNATURE_HASH
        );
    }
}
