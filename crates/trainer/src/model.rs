use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use memmap2::MmapOptions;
use safetensors::SafeTensors;
use std::fs::File;
use std::path::Path;
use tch::{nn, IValue, Kind, Tensor, TrainableCModule};

/// Pretrained encoder with a classification head, exported as TorchScript.
/// Forward takes `(input_ids, attention_mask)` and yields `[batch, num_labels]` logits.
pub struct RelationClassifier {
    module: TrainableCModule,
    num_labels: usize,
}

impl RelationClassifier {
    /// Registers the module's parameters in `vs` so an optimizer built from it
    /// updates them.
    pub fn load<P: AsRef<Path>>(path: P, vs: &nn::VarStore, num_labels: usize) -> Result<Self> {
        let path = path.as_ref();
        let module = TrainableCModule::load(path, vs.root())
            .with_context(|| format!("Failed to load TorchScript module {:?}", path))?;
        debug!(
            "Loaded {:?} with {} parameter tensors",
            path,
            vs.variables().len()
        );
        Ok(Self { module, num_labels })
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    pub fn set_train(&mut self) {
        self.module.set_train();
    }

    pub fn set_eval(&mut self) {
        self.module.set_eval();
    }

    pub fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let output = self.module.forward_is(&[
            IValue::Tensor(input_ids.shallow_clone()),
            IValue::Tensor(attention_mask.shallow_clone()),
        ])?;
        let logits = logits_from(output)?;
        let (_, width) = logits.size2()?;
        if width != self.num_labels as i64 {
            return Err(anyhow!(
                "Model produced {} logits per row, expected {}",
                width,
                self.num_labels
            ));
        }
        Ok(logits)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.module
            .save(path)
            .with_context(|| format!("Failed to save model to {:?}", path))
    }
}

/// Traced encoders return a bare tensor, a tuple whose first element is the
/// logits, or a dict with a `logits` entry.
fn logits_from(output: IValue) -> Result<Tensor> {
    match output {
        IValue::Tensor(t) => Ok(t),
        IValue::Tuple(values) | IValue::GenericList(values) => values
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Model returned an empty tuple"))
            .and_then(logits_from),
        IValue::GenericDict(entries) => entries
            .into_iter()
            .find(|(k, _)| matches!(k, IValue::String(s) if s == "logits"))
            .map(|(_, v)| v)
            .ok_or_else(|| anyhow!("Model output has no \"logits\" entry"))
            .and_then(logits_from),
        other => Err(anyhow!("Unsupported model output: {:?}", other)),
    }
}

/// Copies matching tensors from a `.safetensors` file into `vs`, e.g. encoder
/// weights from a HuggingFace checkpoint. Returns how many were loaded.
pub fn load_safetensors<P: AsRef<Path>>(vs: &mut nn::VarStore, path: P) -> Result<usize> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let buffer = unsafe { MmapOptions::new().map(&file)? };
    let tensors = SafeTensors::deserialize(&buffer)?;

    let mut variables = vs.variables();
    let device = vs.device();
    let mut loaded = 0;

    for (name, view) in tensors.tensors() {
        // TorchScript parameters are registered with '.' replaced by '_'.
        let key = name.replace('.', "_");
        let Some(var) = variables.get_mut(&key) else {
            warn!("Tensor {} found in safetensors but not in model", name);
            continue;
        };

        let shape: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
        if shape != var.size() {
            warn!(
                "Skipping {}: shape {:?} does not match model shape {:?}",
                name,
                shape,
                var.size()
            );
            continue;
        }
        let kind = match view.dtype() {
            safetensors::Dtype::F32 => Kind::Float,
            safetensors::Dtype::F16 => Kind::Half,
            safetensors::Dtype::BF16 => Kind::BFloat16,
            safetensors::Dtype::I64 => Kind::Int64,
            other => return Err(anyhow!("Unsupported dtype for {}: {:?}", name, other)),
        };

        let tensor = Tensor::from_data_size(view.data(), &shape, kind)
            .to_device(device)
            .to_kind(var.kind());
        tch::no_grad(|| {
            var.copy_(&tensor);
        });
        debug!("Loaded tensor: {}", name);
        loaded += 1;
    }

    Ok(loaded)
}
