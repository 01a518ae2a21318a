use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use re_core::{InputFormat, ModelInput, RelationRow};
use std::path::Path;
use tch::{Device, Tensor};
use tokenizers::{Tokenizer, TruncationParams};

/// Pretrained subword tokenizer with truncation and a resolved pad id.
pub struct RelationTokenizer {
    inner: Tokenizer,
    pad_id: i64,
}

impl RelationTokenizer {
    pub fn load<P: AsRef<Path>>(path: P, max_length: usize, pad_token: &str) -> Result<Self> {
        let path = path.as_ref();
        let mut inner = Tokenizer::from_file(path)
            .map_err(|e| anyhow!("Failed to load tokenizer {:?}: {}", path, e))?;
        inner
            .with_truncation(Some(TruncationParams {
                max_length,
                ..Default::default()
            }))
            .map_err(|e| anyhow!("Invalid truncation settings: {}", e))?;

        let pad_id = inner
            .token_to_id(pad_token)
            .or_else(|| inner.get_padding().map(|p| p.pad_id))
            .with_context(|| format!("Tokenizer has no pad token {:?}", pad_token))?;

        Ok(Self {
            inner,
            pad_id: pad_id as i64,
        })
    }

    pub fn pad_id(&self) -> i64 {
        self.pad_id
    }

    pub fn encode(&self, input: &ModelInput) -> Result<Vec<i64>> {
        let encoding = match input {
            ModelInput::Single(text) => self.inner.encode(text.as_str(), true),
            ModelInput::Pair(first, second) => {
                self.inner.encode((first.as_str(), second.as_str()), true)
            }
        }
        .map_err(|e| anyhow!("Tokenization failed: {}", e))?;
        Ok(encoding.get_ids().iter().map(|&id| id as i64).collect())
    }
}

pub struct Batch {
    /// [batch_size, longest]
    pub input_ids: Tensor,
    /// [batch_size, longest], 1 for real tokens
    pub attention_mask: Tensor,
    /// [batch_size], present for labelled data
    pub labels: Option<Tensor>,
}

/// Token ids for every row, padded per batch on demand.
pub struct EncodedDataset {
    inputs: Vec<Vec<i64>>,
    labels: Option<Vec<i64>>,
    pad_id: i64,
    device: Device,
}

impl EncodedDataset {
    pub fn new(
        rows: &[RelationRow],
        labels: Option<&[usize]>,
        tokenizer: &RelationTokenizer,
        format: InputFormat,
        device: Device,
    ) -> Result<Self> {
        let inputs = rows
            .iter()
            .map(|row| row.model_input(format))
            .collect::<re_core::error::Result<Vec<_>>>()?;
        Self::from_inputs(&inputs, labels, tokenizer, device)
    }

    /// Tokenizes inputs that were already built from rows.
    pub fn from_inputs(
        inputs: &[ModelInput],
        labels: Option<&[usize]>,
        tokenizer: &RelationTokenizer,
        device: Device,
    ) -> Result<Self> {
        let ids = inputs
            .iter()
            .map(|input| tokenizer.encode(input))
            .collect::<Result<Vec<_>>>()?;
        Self::from_token_ids(ids, labels.map(|l| l.to_vec()), tokenizer.pad_id(), device)
    }

    pub fn from_token_ids(
        inputs: Vec<Vec<i64>>,
        labels: Option<Vec<usize>>,
        pad_id: i64,
        device: Device,
    ) -> Result<Self> {
        if let Some(labels) = &labels {
            if labels.len() != inputs.len() {
                return Err(anyhow!(
                    "{} inputs but {} labels",
                    inputs.len(),
                    labels.len()
                ));
            }
        }
        Ok(Self {
            inputs,
            labels: labels.map(|l| l.into_iter().map(|y| y as i64).collect()),
            pad_id,
            device,
        })
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn labels(&self) -> Option<Vec<usize>> {
        self.labels
            .as_ref()
            .map(|l| l.iter().map(|&y| y as usize).collect())
    }

    /// Row indices grouped into batches; shuffled first when an rng is given.
    pub fn batch_indices(&self, batch_size: usize, rng: Option<&mut StdRng>) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if let Some(rng) = rng {
            order.shuffle(rng);
        }
        order
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    /// Pads the selected rows to the longest one among them.
    pub fn batch(&self, idxs: &[usize]) -> Batch {
        let longest = idxs
            .iter()
            .map(|&i| self.inputs[i].len())
            .max()
            .unwrap_or(0);
        let mut ids = Vec::with_capacity(idxs.len() * longest);
        let mut mask = Vec::with_capacity(idxs.len() * longest);

        for &i in idxs {
            let row = &self.inputs[i];
            ids.extend_from_slice(row);
            ids.extend(std::iter::repeat(self.pad_id).take(longest - row.len()));
            mask.extend(std::iter::repeat(1i64).take(row.len()));
            mask.extend(std::iter::repeat(0i64).take(longest - row.len()));
        }

        let shape = [idxs.len() as i64, longest as i64];
        let input_ids = Tensor::from_slice(&ids).view(shape).to(self.device);
        let attention_mask = Tensor::from_slice(&mask).view(shape).to(self.device);
        let labels = self.labels.as_ref().map(|labels| {
            let picked: Vec<i64> = idxs.iter().map(|&i| labels[i]).collect();
            Tensor::from_slice(&picked).to(self.device)
        });

        Batch {
            input_ids,
            attention_mask,
            labels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn dataset() -> EncodedDataset {
        EncodedDataset::from_token_ids(
            vec![vec![2, 10, 3], vec![2, 11, 12, 13, 3], vec![2, 3]],
            Some(vec![4, 0, 29]),
            1,
            Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn batch_pads_to_longest() {
        let data = dataset();
        let batch = data.batch(&[0, 1]);
        assert_eq!(batch.input_ids.size(), vec![2, 5]);
        let ids = Vec::<i64>::try_from(batch.input_ids.view(-1)).unwrap();
        assert_eq!(ids, vec![2, 10, 3, 1, 1, 2, 11, 12, 13, 3]);
        let mask = Vec::<i64>::try_from(batch.attention_mask.view(-1)).unwrap();
        assert_eq!(mask, vec![1, 1, 1, 0, 0, 1, 1, 1, 1, 1]);
        let labels = Vec::<i64>::try_from(batch.labels.unwrap()).unwrap();
        assert_eq!(labels, vec![4, 0]);
    }

    #[test]
    fn batch_indices_cover_dataset() {
        let data = dataset();
        assert_eq!(data.batch_indices(2, None), vec![vec![0, 1], vec![2]]);

        let mut rng = StdRng::seed_from_u64(0);
        let mut seen: Vec<usize> = data
            .batch_indices(2, Some(&mut rng))
            .into_iter()
            .flatten()
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn label_count_must_match() {
        assert!(
            EncodedDataset::from_token_ids(vec![vec![1]], Some(vec![]), 0, Device::Cpu).is_err()
        );
        let unlabelled =
            EncodedDataset::from_token_ids(vec![vec![1]], None, 0, Device::Cpu).unwrap();
        assert!(unlabelled.batch(&[0]).labels.is_none());
        assert_eq!(unlabelled.labels(), None);
    }
}
