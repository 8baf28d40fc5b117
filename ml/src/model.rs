use burn::{
    nn::{
        conv::{Conv1d, Conv1dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, Lstm, LstmConfig, PaddingConfig1d, Relu,
    },
    prelude::*,
};

use crate::sequence::DEFAULT_SEQ_LEN;

/// Values per sequence step: size, gap, direction.
pub const STEP_FEATURES: usize = 3;

/// Two-branch classifier: an MLP over the scaled tabular row and a
/// convolution + LSTM over the packet sequence, joined before the head.
#[derive(Module, Debug)]
pub struct FusionModel<B: Backend> {
    tabular1: Linear<B>,
    tabular2: Linear<B>,
    conv: Conv1d<B>,
    lstm: Lstm<B>,
    head1: Linear<B>,
    head2: Linear<B>,
    activation: Relu,
    dropout: Dropout,
}

#[derive(Config, Debug)]
pub struct FusionModelConfig {
    pub num_features: usize,
    pub num_classes: usize,
    /// Sequence length the model was trained on. Artifacts that omit it use
    /// [`DEFAULT_SEQ_LEN`].
    pub seq_len: Option<usize>,
    #[config(default = 128)]
    pub hidden_size: usize,
    #[config(default = 32)]
    pub conv_channels: usize,
    #[config(default = 64)]
    pub lstm_hidden: usize,
    #[config(default = "0.3")]
    pub dropout: f64,
}

impl FusionModelConfig {
    pub fn seq_len(&self) -> usize {
        self.seq_len.unwrap_or(DEFAULT_SEQ_LEN)
    }

    /// Returns the initialized model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> FusionModel<B> {
        let joined = self.hidden_size + self.lstm_hidden;
        FusionModel {
            tabular1: LinearConfig::new(self.num_features, self.hidden_size).init(device),
            tabular2: LinearConfig::new(self.hidden_size, self.hidden_size).init(device),
            conv: Conv1dConfig::new(STEP_FEATURES, self.conv_channels, 3)
                .with_padding(PaddingConfig1d::Same)
                .init(device),
            lstm: LstmConfig::new(self.conv_channels, self.lstm_hidden, true).init(device),
            head1: LinearConfig::new(joined, self.hidden_size).init(device),
            head2: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
            activation: Relu::new(),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }
}

impl<B: Backend> FusionModel<B> {
    /// # Shapes
    ///   - Tabular [batch_size, num_features]
    ///   - Sequences [batch_size, seq_len, 3]
    ///   - Output [batch_size, num_classes]
    pub fn forward(&self, tabular: Tensor<B, 2>, sequences: Tensor<B, 3>) -> Tensor<B, 2> {
        let t = self.tabular1.forward(tabular);
        let t = self.activation.forward(t);
        let t = self.dropout.forward(t);
        let t = self.tabular2.forward(t);
        let t = self.activation.forward(t); // [batch_size, hidden_size]

        let s = sequences.swap_dims(1, 2); // [batch_size, 3, seq_len]
        let s = self.conv.forward(s);
        let s = self.activation.forward(s);
        let s = s.swap_dims(1, 2); // [batch_size, seq_len, conv_channels]
        let (_, hidden) = self.lstm.forward(s, None);
        let [batch_size, seq_len, lstm_hidden] = hidden.dims();
        let s = hidden
            .slice([0..batch_size, seq_len - 1..seq_len, 0..lstm_hidden])
            .reshape([batch_size, lstm_hidden]);

        let x = Tensor::cat(vec![t, s], 1);
        let x = self.head1.forward(x);
        let x = self.activation.forward(x);
        let x = self.dropout.forward(x);

        self.head2.forward(x) // [batch_size, num_classes]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn forward_shape() {
        type B = NdArray;
        let device = Default::default();
        let config = FusionModelConfig::new(6, 3)
            .with_seq_len(Some(10))
            .with_hidden_size(16)
            .with_conv_channels(4)
            .with_lstm_hidden(8);
        let model = config.init::<B>(&device);

        let tabular = Tensor::<B, 2>::zeros([2, 6], &device);
        let sequences = Tensor::<B, 3>::ones([2, 10, STEP_FEATURES], &device);
        let output = model.forward(tabular, sequences);

        assert_eq!(output.dims(), [2, 3]);
    }

    #[test]
    fn seq_len_defaults_to_fifty() {
        let config: FusionModelConfig = serde_json::from_str(
            r#"{"num_features": 4, "num_classes": 3, "hidden_size": 128,
                "conv_channels": 32, "lstm_hidden": 64, "dropout": 0.3}"#,
        )
        .unwrap();

        assert_eq!(config.seq_len, None);
        assert_eq!(config.seq_len(), DEFAULT_SEQ_LEN);
        assert_eq!(FusionModelConfig::new(4, 3).seq_len(), 50);
        assert_eq!(FusionModelConfig::new(4, 3).with_seq_len(Some(12)).seq_len(), 12);
    }
}
