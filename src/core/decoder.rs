use crate::utils::error::{LingxunError, Result};

/// 逐塊的 UTF-8 解碼器。
///
/// 一個多位元組字元可能被切在兩個 chunk 之間，尾端不完整的位元組會保留到下一次
/// `decode` 再拼接，所以逐塊解碼的結果與整段一次解碼完全相同。
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: Vec<u8>,
    consumed: usize,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解碼下一個 chunk，把新增的完整文字附加到 `out`。
    /// 遇到非法位元組時，同一塊中位於其前的合法文字仍會先寫入 `out` 再回傳錯誤，
    /// 因此結果與 chunk 的切法無關。
    pub fn decode(&mut self, chunk: &[u8], out: &mut String) -> Result<()> {
        self.pending.extend_from_slice(chunk);

        let (valid_up_to, invalid) = match std::str::from_utf8(&self.pending) {
            Ok(_) => (self.pending.len(), false),
            // error_len 為 None: 尾端是尚未收完的字元，等下一塊
            Err(e) => (e.valid_up_to(), e.error_len().is_some()),
        };

        let rest = self.pending.split_off(valid_up_to);
        let complete = std::mem::replace(&mut self.pending, rest);
        let offset = self.consumed + complete.len();
        self.consumed = offset;

        let text = String::from_utf8(complete).map_err(|e| LingxunError::DecodeError {
            message: e.to_string(),
        })?;
        out.push_str(&text);

        if invalid {
            return Err(LingxunError::DecodeError {
                message: format!("invalid UTF-8 at byte {}", offset),
            });
        }
        Ok(())
    }

    /// 串流結束時呼叫；仍有殘留位元組代表最後一個字元不完整
    pub fn finalize(self) -> Result<String> {
        if self.pending.is_empty() {
            return Ok(String::new());
        }
        Err(LingxunError::DecodeError {
            message: format!(
                "stream ended inside a multi-byte character ({} dangling bytes at byte {})",
                self.pending.len(),
                self.consumed
            ),
        })
    }
}
