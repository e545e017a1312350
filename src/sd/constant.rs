#![allow(unused)]

// SD/MMC command indexes. The wire encoding is the plain index; bit 6
// marks application-specific commands that need an APP_CMD prefix.
pub const SD_ACMD: u16 = 0x0040;

// Basic commands (class 0)
pub const CMD0: u16 = 0; // GO_IDLE_STATE
pub const CMD1: u16 = 1; // SEND_OP_COND (MMC)
pub const CMD2: u16 = 2; // ALL_SEND_CID
pub const CMD3: u16 = 3; // SEND_RELATIVE_ADDR / SET_RELATIVE_ADDR
pub const CMD4: u16 = 4; // SET_DSR
pub const CMD7: u16 = 7; // SELECT_CARD
pub const CMD8: u16 = 8; // SEND_IF_COND
pub const CMD9: u16 = 9; // SEND_CSD
pub const CMD12: u16 = 12; // STOP_TRANSMISSION
pub const CMD13: u16 = 13; // SEND_STATUS
pub const CMD16: u16 = 16; // SET_BLOCKLEN

// Block transfer commands (class 2 and class 4)
pub const CMD17: u16 = 17; // READ_SINGLE_BLOCK
pub const CMD18: u16 = 18; // READ_MULTIPLE_BLOCK
pub const CMD24: u16 = 24; // WRITE_BLOCK
pub const CMD25: u16 = 25; // WRITE_MULTIPLE_BLOCK

// Lock card (class 7)
pub const CMD42: u16 = 42; // LOCK_UNLOCK

// Enhanced-SD physical partition extension
pub const CMD43: u16 = 43; // SELECT_PARTITION
pub const CMD45: u16 = 45; // QUERY_PARTITION

// Application-specific commands (class 8)
pub const CMD55: u16 = 55; // APP_CMD
pub const ACMD13: u16 = SD_ACMD | 13; // SD_STATUS
pub const ACMD22: u16 = SD_ACMD | 22; // SEND_NUM_WR_BLOCKS
pub const ACMD41: u16 = SD_ACMD | 41; // SD_SEND_OP_COND
pub const ACMD42: u16 = SD_ACMD | 42; // SET_CLR_CARD_DETECT
pub const ACMD51: u16 = SD_ACMD | 51; // SEND_SCR

// SD_INFO1 interrupt flags
pub const INFO1_RESP_END: u64 = 1 << 0; // response end
pub const INFO1_ACCESS_END: u64 = 1 << 2; // data access end
pub const INFO1_CD_REMOVE: u64 = 1 << 3; // removal edge on CD
pub const INFO1_CD_INSERT: u64 = 1 << 4; // insertion edge on CD
pub const INFO1_STATE_CD: u64 = 1 << 5; // CD line level
pub const INFO1_D3_REMOVE: u64 = 1 << 8; // removal edge on DAT3
pub const INFO1_D3_INSERT: u64 = 1 << 9; // insertion edge on DAT3
pub const INFO1_STATE_DAT3: u64 = 1 << 10; // DAT3 line level

pub const INFO1_MASK_DET_CD: u64 = INFO1_CD_REMOVE | INFO1_CD_INSERT;
pub const INFO1_MASK_DET_DAT3: u64 = INFO1_D3_REMOVE | INFO1_D3_INSERT;

// SD_INFO2 interrupt flags
pub const INFO2_CMD_ERR: u64 = 1 << 0; // command index error
pub const INFO2_CRC_ERR: u64 = 1 << 1; // CRC error
pub const INFO2_END_ERR: u64 = 1 << 2; // end bit error
pub const INFO2_DATA_TIMEOUT: u64 = 1 << 3; // data timeout
pub const INFO2_ILL_WRITE: u64 = 1 << 4; // illegal write access
pub const INFO2_ILL_READ: u64 = 1 << 5; // illegal read access
pub const INFO2_RESP_TIMEOUT: u64 = 1 << 6; // response timeout
pub const INFO2_BRE: u64 = 1 << 8; // buffer read enable
pub const INFO2_BWE: u64 = 1 << 9; // buffer write enable
pub const INFO2_ILL_ACCESS: u64 = 1 << 15; // illegal access

pub const INFO2_MASK_ERR: u64 = INFO2_CMD_ERR
    | INFO2_CRC_ERR
    | INFO2_END_ERR
    | INFO2_DATA_TIMEOUT
    | INFO2_ILL_WRITE
    | INFO2_ILL_READ
    | INFO2_RESP_TIMEOUT
    | INFO2_ILL_ACCESS;
pub const INFO2_MASK_BRE: u64 = INFO2_BRE | INFO2_MASK_ERR;
pub const INFO2_MASK_BWE: u64 = INFO2_BWE | INFO2_MASK_ERR;
pub const INFO2_CLEAR_ALL: u64 = 0xffff;

// R1 card status bits
pub const R1_OUT_OF_RANGE: u32 = 1 << 31;
pub const R1_ADDRESS_ERROR: u32 = 1 << 30;
pub const R1_BLOCK_LEN_ERROR: u32 = 1 << 29;
pub const R1_ERASE_SEQ_ERROR: u32 = 1 << 28;
pub const R1_ERASE_PARAM: u32 = 1 << 27;
pub const R1_WP_VIOLATION: u32 = 1 << 26;
pub const R1_CARD_IS_LOCKED: u32 = 1 << 25;
pub const R1_LOCK_UNLOCK_FAILED: u32 = 1 << 24;
pub const R1_COM_CRC_ERROR: u32 = 1 << 23;
pub const R1_ILLEGAL_COMMAND: u32 = 1 << 22;
pub const R1_CARD_ECC_FAILED: u32 = 1 << 21;
pub const R1_CC_ERROR: u32 = 1 << 20;
pub const R1_ERROR: u32 = 1 << 19;
pub const R1_CID_CSD_OVERWRITE: u32 = 1 << 16;
pub const R1_WP_ERASE_SKIP: u32 = 1 << 15;
pub const R1_AKE_SEQ_ERROR: u32 = 1 << 3;

// Every error bit above; CARD_IS_LOCKED is card state, not an error.
pub const R1_ERRORS: u32 = R1_OUT_OF_RANGE
    | R1_ADDRESS_ERROR
    | R1_BLOCK_LEN_ERROR
    | R1_ERASE_SEQ_ERROR
    | R1_ERASE_PARAM
    | R1_WP_VIOLATION
    | R1_LOCK_UNLOCK_FAILED
    | R1_COM_CRC_ERROR
    | R1_ILLEGAL_COMMAND
    | R1_CARD_ECC_FAILED
    | R1_CC_ERROR
    | R1_ERROR
    | R1_CID_CSD_OVERWRITE
    | R1_WP_ERASE_SKIP
    | R1_AKE_SEQ_ERROR;

// OCR bits
pub const OCR_BUSY: u32 = 0x8000_0000; // power-up complete when set
pub const OCR_CCS: u32 = 0x4000_0000; // sector addressing
pub const OCR_HCS: u32 = 0x4000_0000; // host announces high-capacity support

// Operating voltage windows (OCR layout)
pub const SD_VOLT_3_3: u32 = 0x0030_0000; // 3.2-3.4V
pub const SD_VOLT_3_0: u32 = 0x000c_0000; // 2.9-3.1V
pub const SD_VOLT_1_8: u32 = 0x0000_0080;

// SCR fields (stored as big-endian 16-bit halves)
pub const SD_SPEC_REGISTER_MASK: u16 = 0x0f00;
pub const SD_SPEC_10_REGISTER: u16 = 0x0000;
pub const SD_SPEC_11_REGISTER: u16 = 0x0100;
pub const SD_SPEC_20_REGISTER: u16 = 0x0200;
pub const SD_SPEC_30_REGISTER: u16 = 0x8000; // SD_SPEC3, second half

// Clock rates
pub const SD_CLK_400KHZ: u32 = 400_000; // identification ratio
pub const SD_CLK_25MHZ: u32 = 25_000_000;
pub const SD_CLK_50MHZ: u32 = 50_000_000;

// Wait bounds, in shim ticks or poll iterations
pub const SD_TIMEOUT_RESP: u32 = 1_000;
pub const SD_TIMEOUT_MULTIPLE: u32 = 10_000;
pub const SD_TIMEOUT_ERASE_CMD: u32 = 40_000; // CMD42 force erase runs long
pub const SD_CLOCK_SETTLE: u32 = 2;
pub const SD_RBUSY_POLL: u32 = 10_000_000;
pub const OCR_RETRY: u32 = 200;
pub const OCR_POLL_WAIT: u32 = 1;
pub const INIT_RETRY: u32 = 3;

// Transfer geometry
pub const SECTOR_SIZE: usize = 512;
pub const SD_STATUS_BYTES: usize = 64;
pub const SCR_BYTES: usize = 8;
pub const QUERY_PARTITION_SIZE: usize = 512;
pub const QUERY_PARTITION_LIST: u16 = 0x00a1; // CMD45 opcode, shifted into the high argument byte
pub const SD_ERASE_SECTOR: u32 = (8 * 1024) / 512; // fallback when AU is undefined
pub const DSR_DEFAULT: u16 = 0x0404;

// CMD42 control structure flags
pub const LOCK_SET_PWD: u8 = 0x01;
pub const LOCK_CLR_PWD: u8 = 0x02;
pub const LOCK_LOCK: u8 = 0x04;
pub const LOCK_FORCE_ERASE: u8 = 0x08;
pub const LOCK_PWD_MAX: usize = 16;
