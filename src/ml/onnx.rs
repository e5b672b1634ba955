//! ONNX形式への書き出し
//!
//! ONNXファイルはProtocol Buffersでエンコードされた `ModelProto` です。
//! ここでは必要な部分集合（ModelProto / GraphProto / NodeProto / TensorProto /
//! ValueInfoProto / AttributeProto）だけを扱う最小限のエンコーダと、
//! 出力ファイルの概要を読み出すデコーダを持ちます。
//!
//! 参考: https://onnx.ai/onnx/repo-docs/IR.html

use std::path::Path;

use burn::tensor::{backend::Backend, Tensor};

use crate::error::{Error, Result};

/// TensorProto.DataType.FLOAT
const ONNX_FLOAT: i32 = 1;

const PRODUCER_NAME: &str = "handstand_detector";

/// opsetに対応するIRバージョン
pub fn ir_version_for_opset(opset: i64) -> i64 {
    match opset {
        ..=8 => 3,
        9 => 4,
        10 => 5,
        11 => 6,
        12..=14 => 7,
        15..=18 => 8,
        19..=20 => 9,
        _ => 10,
    }
}

// protobuf エンコーダ

/// protobufのワイヤーフォーマット（varint / length-delimited / fixed32）を書く
#[derive(Default)]
struct PbEncoder {
    buf: Vec<u8>,
}

impl PbEncoder {
    fn new() -> Self {
        Self::default()
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn write_varint(&mut self, mut val: u64) {
        loop {
            let byte = (val & 0x7F) as u8;
            val >>= 7;
            if val == 0 {
                self.buf.push(byte);
                break;
            }
            self.buf.push(byte | 0x80);
        }
    }

    fn write_tag(&mut self, field: u32, wire_type: u32) {
        self.write_varint(((field as u64) << 3) | wire_type as u64);
    }

    fn write_varint_field(&mut self, field: u32, val: u64) {
        self.write_tag(field, 0);
        self.write_varint(val);
    }

    /// int64 は負数も2の補数のまま10バイトvarintで書く（zigzagではない）
    fn write_int64_field(&mut self, field: u32, val: i64) {
        self.write_varint_field(field, val as u64);
    }

    fn write_float_field(&mut self, field: u32, val: f32) {
        self.write_tag(field, 5);
        self.buf.extend_from_slice(&val.to_le_bytes());
    }

    fn write_bytes_field(&mut self, field: u32, data: &[u8]) {
        self.write_tag(field, 2);
        self.write_varint(data.len() as u64);
        self.buf.extend_from_slice(data);
    }

    fn write_string_field(&mut self, field: u32, val: &str) {
        self.write_bytes_field(field, val.as_bytes());
    }

    fn write_message_field(&mut self, field: u32, message: PbEncoder) {
        self.write_bytes_field(field, &message.buf);
    }
}

// protobuf デコーダ

struct PbDecoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PbDecoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_varint(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0;
        loop {
            let byte = *self
                .data
                .get(self.pos)
                .ok_or_else(|| Error::Export("protobuf: unexpected end of data".to_string()))?;
            self.pos += 1;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift > 63 {
                return Err(Error::Export("protobuf: varint too long".to_string()));
            }
        }
    }

    fn read_tag(&mut self) -> Result<(u32, u32)> {
        let val = self.read_varint()?;
        Ok(((val >> 3) as u32, (val & 0x7) as u32))
    }

    fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_varint()? as usize;
        if len > self.remaining() {
            return Err(Error::Export("protobuf: field exceeds data".to_string()));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_string(&mut self) -> Result<String> {
        String::from_utf8(self.read_bytes()?.to_vec())
            .map_err(|_| Error::Export("protobuf: invalid UTF-8 string".to_string()))
    }

    fn skip(&mut self, wire_type: u32) -> Result<()> {
        let len = match wire_type {
            0 => {
                self.read_varint()?;
                return Ok(());
            }
            1 => 8,
            2 => {
                self.read_bytes()?;
                return Ok(());
            }
            5 => 4,
            other => {
                return Err(Error::Export(format!(
                    "protobuf: unsupported wire type {other}"
                )))
            }
        };
        if len > self.remaining() {
            return Err(Error::Export("protobuf: field exceeds data".to_string()));
        }
        self.pos += len;
        Ok(())
    }
}

// ONNX メッセージ

/// ホスト側に取り出したパラメータ（float32、行優先）
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub dims: Vec<usize>,
    pub values: Vec<f32>,
}

impl HostTensor {
    pub fn new(dims: Vec<usize>, values: Vec<f32>) -> Self {
        Self { dims, values }
    }

    /// Burnテンソルをホストに読み出す
    pub fn from_tensor<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Self> {
        let dims = tensor.dims().to_vec();
        let values = tensor
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| Error::Export(format!("failed to read tensor data: {e:?}")))?;
        Ok(Self { dims, values })
    }
}

/// 重みとして埋め込むテンソル（TensorProto）
#[derive(Debug, Clone, PartialEq)]
pub struct OnnxTensor {
    pub name: String,
    pub dims: Vec<i64>,
    pub values: Vec<f32>,
}

impl OnnxTensor {
    fn encode(&self) -> PbEncoder {
        let mut enc = PbEncoder::new();
        for &d in &self.dims {
            enc.write_int64_field(1, d); // dims
        }
        enc.write_varint_field(2, ONNX_FLOAT as u64); // data_type
        enc.write_string_field(8, &self.name); // name
        let raw: Vec<u8> = self.values.iter().flat_map(|v| v.to_le_bytes()).collect();
        enc.write_bytes_field(9, &raw); // raw_data
        enc
    }
}

/// ノード属性
#[derive(Debug, Clone, PartialEq)]
pub enum OnnxAttribute {
    Int(i64),
    Float(f32),
    Ints(Vec<i64>),
}

fn encode_attribute(name: &str, val: &OnnxAttribute) -> PbEncoder {
    let mut enc = PbEncoder::new();
    enc.write_string_field(1, name);
    // AttributeProto.type: FLOAT=1, INT=2, INTS=7
    match val {
        OnnxAttribute::Float(f) => {
            enc.write_float_field(2, *f);
            enc.write_varint_field(20, 1);
        }
        OnnxAttribute::Int(i) => {
            enc.write_int64_field(3, *i);
            enc.write_varint_field(20, 2);
        }
        OnnxAttribute::Ints(ints) => {
            for &i in ints {
                enc.write_int64_field(8, i);
            }
            enc.write_varint_field(20, 7);
        }
    }
    enc
}

/// グラフのノード（演算）
#[derive(Debug, Clone, PartialEq)]
pub struct OnnxNode {
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: Vec<(String, OnnxAttribute)>,
}

impl OnnxNode {
    fn encode(&self) -> PbEncoder {
        let mut enc = PbEncoder::new();
        for input in &self.inputs {
            enc.write_string_field(1, input);
        }
        for output in &self.outputs {
            enc.write_string_field(2, output);
        }
        enc.write_string_field(3, &self.name);
        enc.write_string_field(4, &self.op_type);
        for (key, val) in &self.attributes {
            enc.write_message_field(5, encode_attribute(key, val));
        }
        enc
    }
}

/// 入出力の1次元（固定長または名前付きの可変長）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dim {
    Fixed(i64),
    Dynamic(String),
}

/// グラフ入出力の名前と形状（float32固定）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueInfo {
    pub name: String,
    pub dims: Vec<Dim>,
}

impl ValueInfo {
    fn encode(&self) -> PbEncoder {
        let mut shape = PbEncoder::new();
        for dim in &self.dims {
            let mut d = PbEncoder::new();
            match dim {
                Dim::Fixed(v) => d.write_int64_field(1, *v), // dim_value
                Dim::Dynamic(name) => d.write_string_field(2, name), // dim_param
            }
            shape.write_message_field(1, d);
        }

        let mut tensor_type = PbEncoder::new();
        tensor_type.write_varint_field(1, ONNX_FLOAT as u64); // elem_type
        tensor_type.write_message_field(2, shape);

        let mut type_proto = PbEncoder::new();
        type_proto.write_message_field(1, tensor_type);

        let mut vi = PbEncoder::new();
        vi.write_string_field(1, &self.name);
        vi.write_message_field(2, type_proto);
        vi
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut dec = PbDecoder::new(data);
        let mut info = ValueInfo {
            name: String::new(),
            dims: Vec::new(),
        };
        while dec.remaining() > 0 {
            match dec.read_tag()? {
                (1, 2) => info.name = dec.read_string()?,
                (2, 2) => {
                    // TypeProto -> tensor_type -> shape -> dim
                    let type_proto = dec.read_bytes()?;
                    info.dims = decode_nested(type_proto, &[1, 2], |shape| {
                        let mut dims = Vec::new();
                        let mut dec = PbDecoder::new(shape);
                        while dec.remaining() > 0 {
                            match dec.read_tag()? {
                                (1, 2) => dims.push(decode_dim(dec.read_bytes()?)?),
                                (_, wire) => dec.skip(wire)?,
                            }
                        }
                        Ok(dims)
                    })?
                    .unwrap_or_default();
                }
                (_, wire) => dec.skip(wire)?,
            }
        }
        Ok(info)
    }
}

/// `path` のフィールド番号を順にたどって最後のメッセージを `f` に渡す
fn decode_nested<T>(
    data: &[u8],
    path: &[u32],
    f: impl FnOnce(&[u8]) -> Result<T>,
) -> Result<Option<T>> {
    let Some((&field, rest)) = path.split_first() else {
        return f(data).map(Some);
    };
    let mut dec = PbDecoder::new(data);
    while dec.remaining() > 0 {
        match dec.read_tag()? {
            (num, 2) if num == field => {
                let inner = dec.read_bytes()?;
                return decode_nested(inner, rest, f);
            }
            (_, wire) => dec.skip(wire)?,
        }
    }
    Ok(None)
}

fn decode_dim(data: &[u8]) -> Result<Dim> {
    let mut dec = PbDecoder::new(data);
    let mut dim = Dim::Fixed(0);
    while dec.remaining() > 0 {
        match dec.read_tag()? {
            (1, 0) => dim = Dim::Fixed(dec.read_varint()? as i64),
            (2, 2) => dim = Dim::Dynamic(dec.read_string()?),
            (_, wire) => dec.skip(wire)?,
        }
    }
    Ok(dim)
}

/// ONNXモデル全体
#[derive(Debug, Clone, PartialEq)]
pub struct OnnxModel {
    pub graph_name: String,
    pub opset_version: i64,
    pub nodes: Vec<OnnxNode>,
    pub initializers: Vec<OnnxTensor>,
    pub inputs: Vec<ValueInfo>,
    pub outputs: Vec<ValueInfo>,
}

impl OnnxModel {
    /// protobufバイト列にエンコード
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut graph = PbEncoder::new();
        for node in &self.nodes {
            graph.write_message_field(1, node.encode());
        }
        graph.write_string_field(2, &self.graph_name);
        for init in &self.initializers {
            graph.write_message_field(5, init.encode());
        }
        for input in &self.inputs {
            graph.write_message_field(11, input.encode());
        }
        for output in &self.outputs {
            graph.write_message_field(12, output.encode());
        }

        let mut opset = PbEncoder::new();
        opset.write_string_field(1, ""); // デフォルトドメイン
        opset.write_int64_field(2, self.opset_version);

        let mut model = PbEncoder::new();
        model.write_int64_field(1, ir_version_for_opset(self.opset_version));
        model.write_string_field(2, PRODUCER_NAME);
        model.write_string_field(3, env!("CARGO_PKG_VERSION"));
        model.write_message_field(7, graph);
        model.write_message_field(8, opset);
        model.into_bytes()
    }

    /// ファイルに保存（親ディレクトリがなければ作成）
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        std::fs::write(path, self.to_bytes()).map_err(|e| Error::io(path, e))
    }
}

/// 書き出したONNXファイルの概要
#[derive(Debug, Clone, PartialEq)]
pub struct OnnxSummary {
    pub ir_version: i64,
    pub opset_version: i64,
    pub producer_name: String,
    pub inputs: Vec<ValueInfo>,
    pub outputs: Vec<ValueInfo>,
    pub initializer_count: usize,
    pub op_types: Vec<String>,
}

/// ONNXバイト列から入出力・初期化子数・演算の種類を読み出す
pub fn inspect(bytes: &[u8]) -> Result<OnnxSummary> {
    let mut summary = OnnxSummary {
        ir_version: 0,
        opset_version: 0,
        producer_name: String::new(),
        inputs: Vec::new(),
        outputs: Vec::new(),
        initializer_count: 0,
        op_types: Vec::new(),
    };

    let mut dec = PbDecoder::new(bytes);
    while dec.remaining() > 0 {
        match dec.read_tag()? {
            (1, 0) => summary.ir_version = dec.read_varint()? as i64,
            (2, 2) => summary.producer_name = dec.read_string()?,
            (7, 2) => inspect_graph(dec.read_bytes()?, &mut summary)?,
            (8, 2) => {
                let mut opset = PbDecoder::new(dec.read_bytes()?);
                while opset.remaining() > 0 {
                    match opset.read_tag()? {
                        (2, 0) => summary.opset_version = opset.read_varint()? as i64,
                        (_, wire) => opset.skip(wire)?,
                    }
                }
            }
            (_, wire) => dec.skip(wire)?,
        }
    }
    Ok(summary)
}

fn inspect_graph(data: &[u8], summary: &mut OnnxSummary) -> Result<()> {
    let mut dec = PbDecoder::new(data);
    while dec.remaining() > 0 {
        match dec.read_tag()? {
            (1, 2) => {
                let op = node_op_type(dec.read_bytes()?)?;
                if !summary.op_types.contains(&op) {
                    summary.op_types.push(op);
                }
            }
            (5, 2) => {
                dec.read_bytes()?;
                summary.initializer_count += 1;
            }
            (11, 2) => summary.inputs.push(ValueInfo::decode(dec.read_bytes()?)?),
            (12, 2) => summary.outputs.push(ValueInfo::decode(dec.read_bytes()?)?),
            (_, wire) => dec.skip(wire)?,
        }
    }
    Ok(())
}

fn node_op_type(data: &[u8]) -> Result<String> {
    let mut dec = PbDecoder::new(data);
    let mut op_type = String::new();
    while dec.remaining() > 0 {
        match dec.read_tag()? {
            (4, 2) => op_type = dec.read_string()?,
            (_, wire) => dec.skip(wire)?,
        }
    }
    Ok(op_type)
}

// グラフ構築

/// BatchNormをConvの重み・バイアスに畳み込む
///
/// `w' = w * gamma / sqrt(var + eps)`, `b' = (b - mean) * gamma / sqrt(var + eps) + beta`
pub fn fold_batch_norm(
    weight: &HostTensor,
    bias: Option<&HostTensor>,
    bn: &BatchNormParams,
) -> Result<(HostTensor, HostTensor)> {
    let out_channels = weight.dims.first().copied().unwrap_or(0);
    if bn.gamma.values.len() != out_channels {
        return Err(Error::Export(format!(
            "batch norm has {} channels but conv has {}",
            bn.gamma.values.len(),
            out_channels
        )));
    }
    let per_channel = weight.values.len() / out_channels.max(1);

    let mut folded_w = weight.values.clone();
    let mut folded_b = Vec::with_capacity(out_channels);
    for c in 0..out_channels {
        let scale = bn.gamma.values[c] / (bn.running_var.values[c] + bn.epsilon as f32).sqrt();
        for v in &mut folded_w[c * per_channel..(c + 1) * per_channel] {
            *v *= scale;
        }
        let b = bias.map(|b| b.values[c]).unwrap_or(0.0);
        folded_b.push((b - bn.running_mean.values[c]) * scale + bn.beta.values[c]);
    }

    Ok((
        HostTensor::new(weight.dims.clone(), folded_w),
        HostTensor::new(vec![out_channels], folded_b),
    ))
}

/// 推論時のBatchNormパラメータ
#[derive(Debug, Clone)]
pub struct BatchNormParams {
    pub gamma: HostTensor,
    pub beta: HostTensor,
    pub running_mean: HostTensor,
    pub running_var: HostTensor,
    pub epsilon: f64,
}

/// Conv演算の設定（正方カーネル・対称パディング）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvSpec {
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
}

/// モデル構造からONNXグラフを組み立てる
pub struct GraphBuilder {
    nodes: Vec<OnnxNode>,
    initializers: Vec<OnnxTensor>,
    fold_constants: bool,
    counter: usize,
}

impl GraphBuilder {
    pub fn new(fold_constants: bool) -> Self {
        Self {
            nodes: Vec::new(),
            initializers: Vec::new(),
            fold_constants,
            counter: 0,
        }
    }

    /// BatchNormをConvに畳み込むかどうか
    pub fn fold_constants(&self) -> bool {
        self.fold_constants
    }

    pub fn nodes(&self) -> &[OnnxNode] {
        &self.nodes
    }

    pub fn initializers(&self) -> &[OnnxTensor] {
        &self.initializers
    }

    fn fresh(&mut self, op_type: &str) -> String {
        self.counter += 1;
        format!("{}_{}", op_type, self.counter)
    }

    pub fn initializer(&mut self, name: &str, tensor: HostTensor) -> String {
        self.initializers.push(OnnxTensor {
            name: name.to_string(),
            dims: tensor.dims.iter().map(|&d| d as i64).collect(),
            values: tensor.values,
        });
        name.to_string()
    }

    fn node(&mut self, op_type: &str, inputs: Vec<String>, attributes: Vec<(String, OnnxAttribute)>) -> String {
        let name = self.fresh(op_type);
        let output = format!("{name}_out");
        self.nodes.push(OnnxNode {
            name,
            op_type: op_type.to_string(),
            inputs,
            outputs: vec![output.clone()],
            attributes,
        });
        output
    }

    pub fn conv(
        &mut self,
        prefix: &str,
        input: &str,
        weight: HostTensor,
        bias: Option<HostTensor>,
        spec: ConvSpec,
    ) -> String {
        let k = spec.kernel as i64;
        let s = spec.stride as i64;
        let p = spec.padding as i64;

        let mut inputs = vec![input.to_string(), self.initializer(&format!("{prefix}.weight"), weight)];
        if let Some(bias) = bias {
            inputs.push(self.initializer(&format!("{prefix}.bias"), bias));
        }

        self.node(
            "Conv",
            inputs,
            vec![
                ("dilations".to_string(), OnnxAttribute::Ints(vec![1, 1])),
                ("group".to_string(), OnnxAttribute::Int(1)),
                ("kernel_shape".to_string(), OnnxAttribute::Ints(vec![k, k])),
                ("pads".to_string(), OnnxAttribute::Ints(vec![p, p, p, p])),
                ("strides".to_string(), OnnxAttribute::Ints(vec![s, s])),
            ],
        )
    }

    pub fn batch_norm(&mut self, prefix: &str, input: &str, bn: BatchNormParams) -> String {
        let inputs = vec![
            input.to_string(),
            self.initializer(&format!("{prefix}.gamma"), bn.gamma),
            self.initializer(&format!("{prefix}.beta"), bn.beta),
            self.initializer(&format!("{prefix}.running_mean"), bn.running_mean),
            self.initializer(&format!("{prefix}.running_var"), bn.running_var),
        ];
        self.node(
            "BatchNormalization",
            inputs,
            vec![("epsilon".to_string(), OnnxAttribute::Float(bn.epsilon as f32))],
        )
    }

    pub fn relu(&mut self, input: &str) -> String {
        self.node("Relu", vec![input.to_string()], Vec::new())
    }

    pub fn add(&mut self, lhs: &str, rhs: &str) -> String {
        self.node("Add", vec![lhs.to_string(), rhs.to_string()], Vec::new())
    }

    pub fn max_pool(&mut self, input: &str, spec: ConvSpec) -> String {
        let k = spec.kernel as i64;
        let s = spec.stride as i64;
        let p = spec.padding as i64;
        self.node(
            "MaxPool",
            vec![input.to_string()],
            vec![
                ("kernel_shape".to_string(), OnnxAttribute::Ints(vec![k, k])),
                ("pads".to_string(), OnnxAttribute::Ints(vec![p, p, p, p])),
                ("strides".to_string(), OnnxAttribute::Ints(vec![s, s])),
            ],
        )
    }

    pub fn global_average_pool(&mut self, input: &str) -> String {
        self.node("GlobalAveragePool", vec![input.to_string()], Vec::new())
    }

    pub fn flatten(&mut self, input: &str) -> String {
        self.node(
            "Flatten",
            vec![input.to_string()],
            vec![("axis".to_string(), OnnxAttribute::Int(1))],
        )
    }

    /// `y = x @ W + b`（Burnの Linear は重みを [入力, 出力] で持つので transB=0）
    pub fn gemm(&mut self, prefix: &str, input: &str, weight: HostTensor, bias: Option<HostTensor>) -> String {
        let mut inputs = vec![input.to_string(), self.initializer(&format!("{prefix}.weight"), weight)];
        if let Some(bias) = bias {
            inputs.push(self.initializer(&format!("{prefix}.bias"), bias));
        }
        self.node(
            "Gemm",
            inputs,
            vec![
                ("alpha".to_string(), OnnxAttribute::Float(1.0)),
                ("beta".to_string(), OnnxAttribute::Float(1.0)),
                ("transB".to_string(), OnnxAttribute::Int(0)),
            ],
        )
    }

    pub fn sigmoid(&mut self, input: &str) -> String {
        self.node("Sigmoid", vec![input.to_string()], Vec::new())
    }

    /// グラフを閉じて `OnnxModel` にする
    ///
    /// 最後の値の名前を `output.name` に付け替えます。
    pub fn finish(
        mut self,
        graph_name: &str,
        opset_version: i64,
        last: &str,
        input: ValueInfo,
        output: ValueInfo,
    ) -> Result<OnnxModel> {
        let producer = self
            .nodes
            .iter_mut()
            .rev()
            .find(|n| n.outputs.iter().any(|o| o == last))
            .ok_or_else(|| Error::Export(format!("no node produces '{last}'")))?;
        for o in producer.outputs.iter_mut() {
            if o.as_str() == last {
                *o = output.name.clone();
            }
        }

        Ok(OnnxModel {
            graph_name: graph_name.to_string(),
            opset_version,
            nodes: self.nodes,
            initializers: self.initializers,
            inputs: vec![input],
            outputs: vec![output],
        })
    }
}
